use std::time::Duration;

use iam_clock::{DurationSecs, System};
use iam_tokens::{issuer::IamTokenSource, ApiKey, TokenCache, TokenCacheConfig, TokenStatus};
use tokio::time;

#[derive(Debug, clap::Parser)]
struct Opts {
    /// The IAM API key exchanged for access tokens
    #[clap(long, env = "IAM_API_KEY", hide_env_values = true)]
    api_key: String,

    /// The issuing authority's token request URL
    #[clap(long, env = "IAM_TOKEN_URL")]
    token_url: Option<reqwest::Url>,

    /// Seconds before expiry at which a token is considered stale
    #[clap(long, env = "IAM_EARLY_REFRESH_SECS", default_value_t = 300)]
    early_refresh_secs: u64,

    /// Upper bound in seconds on each request to the token issuer
    #[clap(long, env = "IAM_REFRESH_TIMEOUT_SECS", default_value_t = 30)]
    refresh_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = <Opts as clap::Parser>::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;
    let mut issuer = IamTokenSource::new(client);
    if let Some(token_url) = opts.token_url {
        issuer = issuer.with_token_url(token_url);
    }

    let config = TokenCacheConfig::new(
        DurationSecs(opts.early_refresh_secs),
        Duration::from_secs(opts.refresh_timeout_secs),
    );

    let cache = TokenCache::from_issuer(issuer, ApiKey::new(opts.api_key)?, config).await?;

    tracing::info!(
        token = format_args!("{:#?}", cache.current_token().access_token()),
        "first access token"
    );

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        let token = match cache.access_token().await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(error = (&error as &dyn std::error::Error), "no usable token");
                continue;
            }
        };

        let status = token.token_status_with_clock(&System);
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(
                    ?status,
                    stale = token.stale().0,
                    expiry = token.expiry().0,
                    "pulled token"
                )
            }
            TokenStatus::Stale => {
                tracing::warn!(
                    ?status,
                    stale = token.stale().0,
                    expiry = token.expiry().0,
                    "pulled token"
                )
            }
            TokenStatus::Expired => {
                tracing::error!(
                    ?status,
                    stale = token.stale().0,
                    expiry = token.expiry().0,
                    "pulled token"
                )
            }
        }
    }
}
