use aliri_braid::braid;
use std::{convert::Infallible, fmt};
use thiserror::Error;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// A long-lived IAM API key, exchanged for short-lived access tokens
#[braid(
    serde,
    validator,
    debug = "owned",
    display = "owned",
    ref_doc = "A borrowed reference to an IAM [`ApiKey`]"
)]
pub struct ApiKey;

limited_reveal!(ApiKeyRef: "API KEY", 5);

/// An API key was empty
#[derive(Debug, Error)]
#[error("API key must not be empty")]
pub struct InvalidApiKey;

impl From<Infallible> for InvalidApiKey {
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

impl aliri_braid::Validator for ApiKey {
    type Error = InvalidApiKey;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidApiKey)
        } else {
            Ok(())
        }
    }
}

/// A bearer access token
#[braid(
    serde,
    validator,
    debug = "owned",
    display = "owned",
    ref_doc = "A borrowed reference to an [`AccessToken`]"
)]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// An access token was empty
#[derive(Debug, Error)]
#[error("access token must not be empty")]
pub struct InvalidAccessToken;

impl From<Infallible> for InvalidAccessToken {
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

impl aliri_braid::Validator for AccessToken {
    type Error = InvalidAccessToken;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidAccessToken)
        } else {
            Ok(())
        }
    }
}
