//! Token issuers

use std::{error, fmt, sync::Arc};

use async_trait::async_trait;
use iam_clock::{Clock, DurationSecs, System, UnixTime};
use thiserror::Error;

use crate::{AccessToken, ApiKeyRef, IssuedToken};

#[cfg(feature = "iam")]
pub mod iam;

#[cfg(feature = "iam")]
pub use iam::IamTokenSource;

type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An asynchronous issuer of access tokens
///
/// An issuer performs a single exchange of an API key for a token. It holds
/// no token state and never retries; retry policy belongs to the caller.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Exchanges `api_key` for a new access token
    async fn fetch(&self, api_key: &ApiKeyRef) -> Result<IssuedToken, IssuerError>;
}

#[async_trait]
impl<T: TokenIssuer + ?Sized> TokenIssuer for Arc<T> {
    async fn fetch(&self, api_key: &ApiKeyRef) -> Result<IssuedToken, IssuerError> {
        (**self).fetch(api_key).await
    }
}

#[async_trait]
impl<T: TokenIssuer + ?Sized> TokenIssuer for Box<T> {
    async fn fetch(&self, api_key: &ApiKeyRef) -> Result<IssuedToken, IssuerError> {
        (**self).fetch(api_key).await
    }
}

/// An error while attempting to obtain a new token from the issuer
#[derive(Debug, Error)]
pub enum IssuerError {
    /// The issuer could not be reached, or did not answer in time
    #[error("unable to reach token issuer")]
    Unreachable(#[source] BoxError),
    /// The issuer answered with a non-success status
    #[error("token issuer rejected the request with status {status}: {body}")]
    Rejected {
        /// The HTTP status code returned
        status: u16,
        /// The body of the error response
        body: String,
    },
    /// The issuer's response did not contain a usable token
    #[error("malformed token response from issuer")]
    MalformedResponse(#[source] BoxError),
    /// The issuer handed out a token that had already expired when it arrived
    #[error("token issuer returned a token that expired at {expiry}")]
    AlreadyExpired {
        /// The expiration the issuer reported
        expiry: UnixTime,
    },
}

impl IssuerError {
    /// Wraps a transport-level failure
    pub fn unreachable(source: impl Into<BoxError>) -> Self {
        Self::Unreachable(source.into())
    }

    /// Wraps a failure to interpret the issuer's payload
    pub fn malformed(source: impl Into<BoxError>) -> Self {
        Self::MalformedResponse(source.into())
    }
}

/// An issuer that always hands out the same access token
///
/// Each token expires `lifetime` after it is fetched.
pub struct ConstTokenIssuer {
    access_token: AccessToken,
    lifetime: DurationSecs,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl ConstTokenIssuer {
    /// Constructs a new constant issuer
    pub fn new(access_token: AccessToken, lifetime: DurationSecs) -> Self {
        Self {
            access_token,
            lifetime,
            clock: Arc::new(System),
        }
    }

    /// Sets a custom clock to be used
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }
}

impl fmt::Debug for ConstTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConstTokenIssuer")
            .field("access_token", &self.access_token)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenIssuer for ConstTokenIssuer {
    async fn fetch(&self, _: &ApiKeyRef) -> Result<IssuedToken, IssuerError> {
        Ok(IssuedToken::new(
            self.access_token.clone(),
            self.clock.now() + self.lifetime,
        ))
    }
}
