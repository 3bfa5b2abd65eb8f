//! Coordinator background worker.
//!
//! Runs the coordinator cycle on a fixed interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use canopy_ledger::Ledger;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use crate::coordinator::Coordinator;

/// Worker that drives [`Coordinator::run_cycle`].
pub struct CoordinatorWorker {
    coordinator: Coordinator,
    interval: Duration,
}

impl CoordinatorWorker {
    /// Create a new coordinator worker.
    pub fn new(ledger: Arc<dyn Ledger>, interval: Duration) -> Self {
        Self {
            coordinator: Coordinator::new(ledger),
            interval,
        }
    }

    /// Run until shutdown is signaled. A failing cycle is logged and the
    /// loop carries on.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting coordinator worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.coordinator.run_cycle().await {
                        Ok(stats) if stats.changed() => {
                            info!(
                                records = stats.records_seen,
                                deploys_started = stats.deploys_started,
                                removals_started = stats.removals_started,
                                conflicts = stats.conflicts,
                                "Coordinator cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Coordinator cycle failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Coordinator worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_ledger::MemoryLedger;

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
        let worker = CoordinatorWorker::new(ledger, Duration::from_millis(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
