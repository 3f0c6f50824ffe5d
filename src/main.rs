use replydesk::{config::Config, connector::Disconnected, App};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging: RUST_LOG wins, LOG_LEVEL otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},async_openai=warn,hyper=warn,reqwest=warn",
            config.log_level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Configuration loaded: {:?}", config);

    // No messaging session is wired in yet, so cycles gate-skip until one is
    let app = App::build(config, Arc::new(Disconnected))?;
    match app.sync_threads().await {
        Ok(count) => info!("Thread catalog ready: {} threads", count),
        Err(e) => warn!("Thread catalog not synced: {:#}", e),
    }
    app.scheduler.start();
    info!("replydesk is running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
    app.scheduler.stop().await;
    Ok(())
}
