//! hifz-engine - HTTP Server Entry Point
//!
//! Starts the HTTP server, the orphan reconciler, and the outbox dispatcher.

use hifz_engine::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hifz_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: store={:?}, data_dir={}, dev_mode={}, scoring={}",
        config.store_type,
        config.data_dir.display(),
        config.dev_mode,
        if config.scoring.is_enabled() { "enabled" } else { "disabled" }
    );

    api::serve(config).await?;

    Ok(())
}
