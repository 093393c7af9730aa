use tracing_subscriber::EnvFilter;

use winterm::api;
use winterm::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("winterm=info,tower_http=warn")),
        )
        .init();

    let config = Config::from_env();
    if config.pin_generated {
        tracing::info!(pin = %config.pin, "generated login PIN (set WINTERM_PIN to fix one)");
    }

    api::serve(config).await
}
