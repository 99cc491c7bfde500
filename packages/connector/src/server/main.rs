// Main entry point for the connector runtime

use anyhow::{Context, Result};
use connector_core::kernel::{ConnectorDeps, ConnectorKernel};
use connector_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,connector_core=debug,statemachine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting dataspace connector");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    tracing::info!(runtime_id = %config.runtime_id, "Configuration loaded");

    // Build state machines
    let kernel = ConnectorKernel::in_memory(&config, &ConnectorDeps::local())
        .context("Failed to build state machines")?;
    kernel.start().context("Failed to start state machines")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    kernel.stop().await.context("Unclean shutdown")?;
    tracing::info!("Connector stopped");
    Ok(())
}
