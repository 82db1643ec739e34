//! Configuration for a [`TokenCache`][crate::TokenCache]

use std::{fmt, sync::Arc, time::Duration};

use iam_clock::{Clock, DurationSecs, System};

use crate::{IssuedToken, TokenWithLifetime};

/// Configuration for determining when a token should be renewed
#[derive(Clone)]
pub struct TokenCacheConfig {
    early_refresh: DurationSecs,
    refresh_timeout: Duration,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl Default for TokenCacheConfig {
    /// Default cache configuration
    ///
    /// Tokens become stale five minutes before they expire, each call to the
    /// issuer is bounded to 30 seconds, and the system clock is used.
    fn default() -> Self {
        Self::new(DurationSecs(300), Duration::from_secs(30))
    }
}

impl TokenCacheConfig {
    /// Constructs a new cache configuration
    ///
    /// A token is considered stale once it is within `early_refresh` of its
    /// expiry. Every request to the token issuer is abandoned after
    /// `refresh_timeout`.
    pub fn new(early_refresh: DurationSecs, refresh_timeout: Duration) -> Self {
        Self {
            early_refresh,
            refresh_timeout,
            clock: Arc::new(System),
        }
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// The window before expiry during which a token is stale
    #[inline]
    pub fn early_refresh(&self) -> DurationSecs {
        self.early_refresh
    }

    /// The upper bound on a single request to the token issuer
    #[inline]
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// The clock the cache judges token freshness by
    #[inline]
    pub fn clock(&self) -> &(dyn Clock + Send + Sync) {
        &*self.clock
    }

    /// Stamps a freshly issued token with its receipt time and staleness
    pub fn create_token(&self, issued: IssuedToken) -> TokenWithLifetime {
        TokenWithLifetime::new(
            issued.access_token,
            self.clock.now(),
            issued.expiration,
            self.early_refresh,
        )
    }
}

impl fmt::Debug for TokenCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCacheConfig")
            .field("early_refresh", &self.early_refresh)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("now", &self.clock.now())
            .finish()
    }
}
