//! Daemon binary entry point.

use gubernator::config::ConfigLoader;
use gubernator::Daemon;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gubernator.toml".to_string());
    let config = ConfigLoader::new().load_or_default(&config_path)?;

    let filter = EnvFilter::try_from_env("GUBER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        "starting gubernator"
    );

    let daemon = Daemon::spawn(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received; shutting down");
    daemon.shutdown().await;
    Ok(())
}
