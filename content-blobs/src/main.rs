// content-blobs maintenance daemon
// Composes the blob subsystem and runs the scheduled file cleanup

use anyhow::Context;
use content_blobs::config::BlobStorageConfig;
use content_blobs::services::{CleanupFrequency, CleanupScheduler};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "content_blobs=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting content-blobs maintenance");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BlobStorageConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let frequency: CleanupFrequency = config
        .cleanup_interval
        .parse()
        .context("Invalid cleanup interval")?;

    let state = content_blobs::app::setup(config)
        .await
        .context("Failed to initialize blob storage")?;

    // Reclaim whatever is already due before waiting for the first tick
    if let Err(e) = state
        .cleanup
        .run_maintenance(&tokio_util::sync::CancellationToken::new())
        .await
    {
        tracing::error!("Initial cleanup failed: {}", e);
    }

    let scheduler = CleanupScheduler::new(state.cleanup.clone()).await?;
    scheduler.schedule_cleanup(frequency).await?;
    scheduler.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    scheduler.shutdown().await?;
    state.pool.close().await;

    Ok(())
}
