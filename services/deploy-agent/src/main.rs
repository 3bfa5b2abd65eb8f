//! canopy deploy agent
//!
//! Runs on a node of the overlay tree and provisions or tears down the
//! node's children as the coordinator releases them.

use std::sync::Arc;

use anyhow::Result;
use canopy_agent::{Agent, AgentConfig, ContainerSequenceBuilder, Executor, SshConnector};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::from_env()?;

    // Prefer RUST_LOG, fall back to CANOPY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        external_address = %config.external_address,
        install_dir = %config.install_dir,
        docker_files_dir = %config.docker_files_dir.display(),
        "Starting canopy agent"
    );

    let ledger = match config.ledger.connect(false).await {
        Ok(ledger) => ledger,
        Err(e) => {
            error!(error = %e, "Failed to connect to ledger");
            return Err(e.into());
        }
    };

    let connector = SshConnector::new(config.connect_timeout, config.host_keys);

    let builder = ContainerSequenceBuilder::new(config.layout(), Arc::clone(&ledger));
    let executor = Executor::new(
        Arc::clone(&ledger),
        Arc::new(connector),
        Arc::new(builder),
        config.local_node(),
    );
    let agent = Arc::new(Agent::new(config.settings(), ledger, Arc::new(executor)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent_handle = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut agent_handle => {
            if let Err(e) = result {
                error!(error = %e, "Agent task panicked");
            }
            return Ok(());
        }
    }

    // Stop claiming; executions already running are left to finish.
    let _ = shutdown_tx.send(true);
    info!("Waiting for in-flight executions...");
    if let Err(e) = agent_handle.await {
        error!(error = %e, "Agent task panicked");
    }

    info!("Agent shutdown complete");
    Ok(())
}
