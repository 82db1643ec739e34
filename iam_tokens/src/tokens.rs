use iam_clock::{Clock, DurationSecs, UnixTime};

use super::{AccessToken, AccessTokenRef};

/// A token exactly as returned by the issuing authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// The bearer access token
    pub access_token: AccessToken,
    /// The time at which the token stops being accepted
    pub expiration: UnixTime,
}

impl IssuedToken {
    /// Constructs a new issued token
    pub fn new(access_token: AccessToken, expiration: UnixTime) -> Self {
        Self {
            access_token,
            expiration,
        }
    }
}

/// A token as returned by the authority with some additional lifetime information
///
/// Tokens are never mutated once constructed. A refresh replaces the whole
/// value.
#[derive(Debug)]
pub struct TokenWithLifetime {
    access_token: AccessToken,
    issued: UnixTime,
    stale: UnixTime,
    expiry: UnixTime,
}

/// A token's lifecycle status
///
/// Statuses are ordered from best to worst, so `status >= TokenStatus::Stale`
/// reads as "in need of a refresh".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenStatus {
    /// The token is fresh and valid
    Fresh,
    /// The token is valid, but should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

impl TokenWithLifetime {
    pub(crate) fn new(
        access_token: AccessToken,
        issued: UnixTime,
        expiry: UnixTime,
        early_refresh: DurationSecs,
    ) -> Self {
        Self {
            access_token,
            issued,
            stale: expiry - early_refresh,
            expiry,
        }
    }

    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the token's lifetime as seen from the time it was received
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.expiry - self.issued
    }

    /// Gets the time that the token was received
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time that the token will become stale
    #[inline]
    pub fn stale(&self) -> UnixTime {
        self.stale
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the token's lifetime status based on the current time
    /// as reported by the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock + ?Sized>(&self, clock: &C) -> TokenStatus {
        self.token_status_at(clock.now())
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.stale {
            TokenStatus::Fresh
        } else if time < self.expiry {
            TokenStatus::Stale
        } else {
            TokenStatus::Expired
        }
    }

    /// Gets a duration for how much longer the token would be fresh as of the
    /// provided time
    #[inline]
    pub fn until_stale_at(&self, time: UnixTime) -> DurationSecs {
        self.stale - time
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expiry - time
    }
}
