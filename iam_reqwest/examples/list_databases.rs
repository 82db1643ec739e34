use iam_reqwest::AccessTokenMiddleware;
use iam_tokens::{ApiKey, TokenCache};

#[derive(Debug, clap::Parser)]
struct Opts {
    /// The IAM API key exchanged for access tokens
    #[clap(long, env = "IAM_API_KEY", hide_env_values = true)]
    api_key: String,

    /// The base URL of the database account
    #[clap(long, env = "CLOUDANT_URL")]
    url: reqwest::Url,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = <Opts as clap::Parser>::parse();

    let token_cache = TokenCache::new(ApiKey::new(opts.api_key)?).await?;
    let client = AccessTokenMiddleware::new(token_cache).authenticate(reqwest::Client::new());

    let resp = client
        .get(opts.url.join("_all_dbs")?)
        .send()
        .await?
        .error_for_status()?;

    tracing::info!(databases = %resp.text().await?, "listed databases");

    Ok(())
}
