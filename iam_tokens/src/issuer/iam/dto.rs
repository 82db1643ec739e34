//! DTOs for interacting with the IAM token endpoint

use iam_clock::UnixTime;
use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, ApiKeyRef};

/// The grant type used to exchange an API key for an access token
pub const API_KEY_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

/// Form payload exchanging an API key for a token
#[derive(Debug)]
pub(super) struct ApiKeyGrant<'a> {
    pub api_key: &'a ApiKeyRef,
}

impl Serialize for ApiKeyGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ApiKeyGrant", 2)?;
        ser.serialize_field("grant_type", API_KEY_GRANT_TYPE)?;
        ser.serialize_field("apikey", self.api_key.as_str())?;
        ser.end()
    }
}

/// The fields of an IAM token response this crate consumes
///
/// The endpoint also returns `refresh_token`, `token_type`, `expires_in`,
/// and `scope`, which are ignored.
#[derive(Debug, Deserialize, Serialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    pub expiration: UnixTime,
}
