use std::sync::Arc;
use std::time::Duration;

use env_logger::Env;

use discovery_service::config::DiscoveryConfig;
use discovery_service::db;
use discovery_service::discovery::DiscoveryService;
use discovery_service::error::DiscoveryError;
use discovery_service::provider;

/// Grace period for the discovery loop to unwind after shutdown completes.
const RUN_STOP_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = DiscoveryConfig::from_env()?;
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| DiscoveryError::Config("DATABASE_URL is required".into()))?;

    let pool = db::connect(&database_url).await.map_err(DiscoveryError::Database)?;
    db::MIGRATOR.run(&pool).await.map_err(DiscoveryError::Migration)?;

    let provider = provider::from_config(&config)?;
    let shutdown_timeout = config.shutdown_timeout;

    let service = Arc::new(DiscoveryService::new(pool, provider, config));
    let runner = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run().await })
    };

    tokio::signal::ctrl_c().await?;
    log::info!("termination signal received, shutting down");

    let graceful = service.shutdown(shutdown_timeout).await;
    if !graceful {
        log::warn!("some storage operations may not have completed");
    }

    if tokio::time::timeout(RUN_STOP_GRACE, runner).await.is_err() {
        log::warn!("discovery loop did not stop within the grace period");
    }

    Ok(())
}
