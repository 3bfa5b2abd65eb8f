//! canopy coordinator
//!
//! Single fleet-wide process that resolves deployment and removal
//! dependencies in the lifecycle ledger.

use anyhow::Result;
use canopy_coordinator::{config, CoordinatorWorker};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to CANOPY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cycle_interval_ms = config.cycle_interval.as_millis() as u64,
        "Starting canopy coordinator"
    );

    let ledger = match config.ledger.connect(config.dev_mode).await {
        Ok(ledger) => ledger,
        Err(e) => {
            error!(error = %e, "Failed to connect to ledger");
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = CoordinatorWorker::new(ledger, config.cycle_interval);
    let mut worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "Coordinator worker panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(std::time::Duration::from_secs(10), worker_handle)
        .await
        .is_err()
    {
        warn!("Coordinator worker did not shut down in time");
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
