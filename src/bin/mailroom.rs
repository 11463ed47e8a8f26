//! # Mailroom Server
//!
//! Runs the foremen, crons and status server until SIGINT or SIGTERM.
//!
//! ## Usage
//!
//! ```bash
//! # Run with mailroom.toml from the working directory, if present
//! cargo run --bin mailroom
//!
//! # Run with a specific file, overriding single values from the environment
//! MAILROOM_CONFIG=/etc/mailroom.toml MAILROOM_WORKERS_BATCH=16 cargo run --bin mailroom
//! ```

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use mailroom_core::config::ConfigManager;
use mailroom_core::logging;
use mailroom_core::runtime::Runtime;
use mailroom_core::service::Service;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConfigManager::load()?;
    let config = manager.config().clone();

    logging::init_tracing(&config.log_level, config.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %config.instance_name,
        source = ?manager.source_file(),
        "Starting mailroom"
    );

    let rt = Arc::new(
        Runtime::from_config(config)
            .await
            .map_err(|e| format!("Failed to initialize runtime: {e}"))?,
    );

    let mut service = Service::new(rt);
    if let Err(e) = service.start().await {
        error!(error = %e, "Failed to start service");
        service.stop().await;
        return Err(e.into());
    }

    shutdown_signal().await?;

    info!("Shutdown signal received, stopping");
    service.stop().await;
    info!("Mailroom stopped");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C");
            }
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
