//! A token issuer backed by the IBM Cloud IAM identity service

use async_trait::async_trait;
use reqwest::header;

use super::{IssuerError, TokenIssuer};
use crate::{ApiKeyRef, IssuedToken};

mod dto;

pub use dto::API_KEY_GRANT_TYPE;

/// The public IBM Cloud IAM token endpoint
pub const IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";

/// Exchanges API keys for access tokens against an IAM token endpoint
#[derive(Clone, Debug)]
pub struct IamTokenSource {
    client: reqwest::Client,
    token_url: String,
}

impl Default for IamTokenSource {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl IamTokenSource {
    /// Constructs a new source against the public IAM endpoint
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            token_url: IAM_TOKEN_URL.to_owned(),
        }
    }

    /// Sends token requests to `token_url` instead of the public endpoint
    pub fn with_token_url(mut self, token_url: reqwest::Url) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// The endpoint this source requests tokens from
    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl TokenIssuer for IamTokenSource {
    async fn fetch(&self, api_key: &ApiKeyRef) -> Result<IssuedToken, IssuerError> {
        request_token(&self.client, &self.token_url, api_key).await
    }
}

#[tracing::instrument(
    err,
    skip(client, api_key),
    fields(credentials.grant_type = API_KEY_GRANT_TYPE),
)]
async fn request_token(
    client: &reqwest::Client,
    token_url: &str,
    api_key: &ApiKeyRef,
) -> Result<IssuedToken, IssuerError> {
    tracing::trace!("requesting token from authority");

    let resp = client
        .post(token_url)
        .header(header::ACCEPT, "application/json")
        .form(&dto::ApiKeyGrant { api_key })
        .send()
        .await
        .map_err(IssuerError::unreachable)?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuing authority"
    );

    if !status.is_success() {
        let body = resp.text().await.map_err(IssuerError::unreachable)?;
        return Err(IssuerError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let body = resp.bytes().await.map_err(IssuerError::unreachable)?;
    let resp: dto::TokenResponse =
        serde_json::from_slice(&body).map_err(IssuerError::malformed)?;

    tracing::info!(expiry = resp.expiration.0, "received new access token");

    Ok(IssuedToken::new(resp.access_token, resp.expiration))
}
