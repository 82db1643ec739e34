use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use iam_clock::UnixTime;
use thiserror::Error;
use tokio::{sync::watch, task::AbortHandle};

use crate::{
    issuer::{IssuerError, TokenIssuer},
    ApiKey, ApiKeyRef, IssuedToken, TokenCacheConfig, TokenStatus, TokenWithLifetime,
};

type RefreshOutcome = Result<Arc<TokenWithLifetime>, Arc<IssuerError>>;

/// An error obtaining a usable access token
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The held token has expired and the refresh that would have replaced it failed
    ///
    /// Every caller waiting on the same refresh receives the same `cause`.
    #[error("unable to refresh expired access token")]
    RefreshFailed {
        /// The issuer failure that ended the refresh
        #[source]
        cause: Arc<IssuerError>,
    },
    /// The refresh task ended without reporting an outcome
    #[error("access token refresh was abandoned before completing")]
    Abandoned,
}

impl RefreshError {
    /// The issuer failure behind this error, if there was one
    pub fn cause(&self) -> Option<&Arc<IssuerError>> {
        match self {
            Self::RefreshFailed { cause } => Some(cause),
            Self::Abandoned => None,
        }
    }
}

/// A self-refreshing cache holding the current access token
///
/// The cache always holds a token. Callers ask for a usable token with
/// [`access_token()`][Self::access_token()]:
///
/// * a fresh token is handed out as is;
/// * a stale token is still handed out, but a background refresh is started
///   if none is running;
/// * an expired token is never handed out. The caller waits for the running
///   refresh, or starts one, and receives either the new token or the
///   refresh's error.
///
/// At most one refresh is in flight per cache. Clones share the same cache,
/// and dropping the last clone aborts any refresh still in flight.
#[derive(Clone)]
pub struct TokenCache {
    shared: Arc<Shared>,
}

struct Shared {
    api_key: ApiKey,
    issuer: Arc<dyn TokenIssuer>,
    config: TokenCacheConfig,
    current: watch::Sender<Arc<TokenWithLifetime>>,
    refresh: Mutex<Option<InFlight>>,
}

struct InFlight {
    outcome: watch::Receiver<Option<RefreshOutcome>>,
    task: AbortHandle,
}

impl InFlight {
    /// A refresh task that panicked leaves its entry behind with a closed channel
    fn is_live(&self) -> bool {
        self.outcome.has_changed().is_ok()
    }
}

enum Refresh {
    Settled(Arc<TokenWithLifetime>),
    Pending(watch::Receiver<Option<RefreshOutcome>>),
}

impl Shared {
    fn lock_refresh(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let in_flight = self
            .refresh
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(in_flight) = in_flight {
            tracing::debug!("token cache dropped, aborting in-flight refresh");
            in_flight.task.abort();
        }
    }
}

#[cfg(feature = "iam")]
impl TokenCache {
    /// Constructs a cache that exchanges `api_key` against the public IAM endpoint
    ///
    /// The first token is fetched before this returns, so an invalid key fails here.
    pub async fn new(api_key: ApiKey) -> Result<Self, IssuerError> {
        Self::from_issuer(
            crate::issuer::IamTokenSource::default(),
            api_key,
            TokenCacheConfig::default(),
        )
        .await
    }
}

impl TokenCache {
    /// Constructs a cache over an arbitrary token issuer
    ///
    /// The first token is fetched before this returns. Any failure, including
    /// exceeding the configured refresh timeout, is returned and no cache is
    /// created.
    pub async fn from_issuer<I>(
        issuer: I,
        api_key: ApiKey,
        config: TokenCacheConfig,
    ) -> Result<Self, IssuerError>
    where
        I: TokenIssuer + 'static,
    {
        let issuer: Arc<dyn TokenIssuer> = Arc::new(issuer);
        let issued = fetch_with_timeout(&*issuer, &api_key, config.refresh_timeout()).await?;
        let token = accept_token(&config, issued)?;

        tracing::debug!(
            token.stale = token.stale().0,
            token.expiry = token.expiry().0,
            "obtained initial access token"
        );

        let (current, _) = watch::channel(Arc::new(token));

        Ok(Self {
            shared: Arc::new(Shared {
                api_key,
                issuer,
                config,
                current,
                refresh: Mutex::new(None),
            }),
        })
    }

    /// The token currently held, without checking or refreshing it
    pub fn current_token(&self) -> Arc<TokenWithLifetime> {
        Arc::clone(&self.shared.current.borrow())
    }

    /// Whether a refresh is in flight
    pub fn is_refreshing(&self) -> bool {
        self.shared
            .lock_refresh()
            .as_ref()
            .map_or(false, InFlight::is_live)
    }

    /// The configuration this cache was built with
    pub fn config(&self) -> &TokenCacheConfig {
        &self.shared.config
    }

    /// Obtains a token that is valid now
    ///
    /// Fails only when the held token has expired and the refresh replacing
    /// it failed. The next call will try again.
    pub async fn access_token(&self) -> Result<Arc<TokenWithLifetime>, RefreshError> {
        let token = self.current_token();
        let now = self.shared.config.clock().now();

        match token.token_status_at(now) {
            TokenStatus::Fresh => Ok(token),
            TokenStatus::Stale => match self.begin_refresh(TokenStatus::Stale, now) {
                Refresh::Settled(newer) => Ok(newer),
                Refresh::Pending(_) => Ok(token),
            },
            TokenStatus::Expired => {
                tracing::debug!(
                    token.expiry = token.expiry().0,
                    "access token expired, waiting on refresh"
                );

                match self.begin_refresh(TokenStatus::Expired, now) {
                    Refresh::Settled(newer) => Ok(newer),
                    Refresh::Pending(outcome) => wait_for_outcome(outcome).await,
                }
            }
        }
    }

    /// Joins the in-flight refresh or starts one
    ///
    /// If the held token has already been replaced by something better than
    /// `trigger` since the caller looked, no refresh is started.
    fn begin_refresh(&self, trigger: TokenStatus, now: UnixTime) -> Refresh {
        let mut in_flight = self.shared.lock_refresh();

        if let Some(running) = in_flight.as_ref() {
            if running.is_live() {
                return Refresh::Pending(running.outcome.clone());
            }
            tracing::warn!("previous token refresh ended without an outcome, starting another");
        }

        let token = self.current_token();
        if token.token_status_at(now) < trigger {
            return Refresh::Settled(token);
        }

        tracing::debug!(?trigger, "starting access token refresh");

        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(refresh_token(
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.issuer),
            self.shared.api_key.clone(),
            self.shared.config.refresh_timeout(),
            tx,
        ));

        *in_flight = Some(InFlight {
            outcome: rx.clone(),
            task: task.abort_handle(),
        });

        Refresh::Pending(rx)
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("api_key", &self.shared.api_key)
            .field("token", &self.current_token())
            .field("config", &self.shared.config)
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

async fn fetch_with_timeout(
    issuer: &dyn TokenIssuer,
    api_key: &ApiKeyRef,
    timeout: Duration,
) -> Result<IssuedToken, IssuerError> {
    match tokio::time::timeout(timeout, issuer.fetch(api_key)).await {
        Ok(result) => result,
        Err(elapsed) => Err(IssuerError::unreachable(elapsed)),
    }
}

/// Stamps an issued token, refusing one that is already expired
fn accept_token(
    config: &TokenCacheConfig,
    issued: IssuedToken,
) -> Result<TokenWithLifetime, IssuerError> {
    let token = config.create_token(issued);
    if token.token_status_at(token.issued()) == TokenStatus::Expired {
        return Err(IssuerError::AlreadyExpired {
            expiry: token.expiry(),
        });
    }
    Ok(token)
}

async fn wait_for_outcome(
    mut outcome: watch::Receiver<Option<RefreshOutcome>>,
) -> Result<Arc<TokenWithLifetime>, RefreshError> {
    let outcome = outcome
        .wait_for(Option::is_some)
        .await
        .map_err(|_| RefreshError::Abandoned)?;

    match &*outcome {
        Some(Ok(token)) => Ok(Arc::clone(token)),
        Some(Err(cause)) => Err(RefreshError::RefreshFailed {
            cause: Arc::clone(cause),
        }),
        None => Err(RefreshError::Abandoned),
    }
}

/// Runs one refresh to completion and publishes its outcome
///
/// Only a weak handle to the cache is held across the issuer call, so a
/// dropped cache is never written to.
async fn refresh_token(
    shared: Weak<Shared>,
    issuer: Arc<dyn TokenIssuer>,
    api_key: ApiKey,
    timeout: Duration,
    tx: watch::Sender<Option<RefreshOutcome>>,
) {
    let result = fetch_with_timeout(&*issuer, &api_key, timeout).await;

    let Some(shared) = shared.upgrade() else {
        tracing::debug!("token cache dropped during refresh, discarding result");
        return;
    };

    let outcome = match result.and_then(|issued| accept_token(&shared.config, issued)) {
        Ok(token) => {
            let token = Arc::new(token);
            tracing::info!(
                token.stale = token.stale().0,
                token.expiry = token.expiry().0,
                "refreshed access token"
            );
            Ok(token)
        }
        Err(error) => {
            let now = shared.config.clock().now();
            let held = Arc::clone(&shared.current.borrow());
            if held.token_status_at(now) == TokenStatus::Expired {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    token.expiry = held.expiry().0,
                    "error refreshing expired access token"
                );
            } else {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    token.until_expired = held.until_expired_at(now).0,
                    "error refreshing stale access token, will retry on next request"
                );
            }
            Err(Arc::new(error))
        }
    };

    {
        let mut in_flight = shared.lock_refresh();
        if let Ok(token) = &outcome {
            shared.current.send_replace(Arc::clone(token));
        }
        *in_flight = None;
    }

    tx.send_replace(Some(outcome));
}
