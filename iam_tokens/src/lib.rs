//! A self-refreshing cache of IAM access tokens
//!
//! Services that authenticate with a long-lived API key exchange it with an
//! identity service for a short-lived bearer token. This crate holds that
//! token on behalf of every outgoing request and renews it without callers
//! needing to manage its lifecycle.
//!
//! Renewal is driven lazily by the requests themselves, using two thresholds:
//!
//! * once a token is _stale_ (within the configured early refresh window of
//!   its expiry), the next request starts a refresh in the background and
//!   carries on with the still-valid token;
//! * once a token has _expired_, requests wait for a refresh to complete
//!   rather than be sent with a token that will be rejected. If that refresh
//!   fails, every waiting request receives the same error.
//!
//! No matter how many requests observe a stale or expired token at once,
//! only one refresh is ever in flight per cache.
//!
//! ```
//! use iam_clock::DurationSecs;
//! use iam_tokens::{issuer::ConstTokenIssuer, AccessToken, ApiKey, TokenCache, TokenCacheConfig};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let issuer = ConstTokenIssuer::new(AccessToken::from_static("token"), DurationSecs(3600));
//!
//! let cache = TokenCache::from_issuer(
//!     issuer,
//!     ApiKey::from_static("my-api-key"),
//!     TokenCacheConfig::default(),
//! )
//! .await
//! .unwrap();
//!
//! let token = cache.access_token().await.unwrap();
//! assert_eq!(token.access_token().as_str(), "token");
//! # }
//! ```
//!
//! Against IBM Cloud, [`TokenCache::new()`] wires up an
//! [`IamTokenSource`][issuer::IamTokenSource] with the default configuration.
//!
//! # Features
//!
//! * `iam` (default): Provides the [`IamTokenSource`][issuer::IamTokenSource]
//!   issuer based on [reqwest].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod cache;
mod config;
pub mod issuer;
mod tokens;

pub use braids::*;
pub use cache::{RefreshError, TokenCache};
pub use config::TokenCacheConfig;
pub use tokens::{IssuedToken, TokenStatus, TokenWithLifetime};
