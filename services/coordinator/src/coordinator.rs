//! One coordinator pass over the ledger.

use std::sync::Arc;

use canopy_ledger::{DeploymentStatus, Ledger, LedgerResult};
use canopy_reconcile::{apply_transition, plan_transitions, LedgerSnapshot, TransitionOutcome};
use tracing::{debug, info, instrument, warn};

/// Statistics from a coordinator cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub records_seen: usize,
    pub deploys_started: usize,
    pub removals_started: usize,
    pub conflicts: usize,
    pub write_failures: usize,
}

impl CycleStats {
    /// True if the cycle wrote anything.
    pub fn changed(&self) -> bool {
        self.deploys_started > 0 || self.removals_started > 0
    }
}

/// Fleet-wide dependency resolver.
pub struct Coordinator {
    ledger: Arc<dyn Ledger>,
}

impl Coordinator {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Read every record and write each transition the snapshot allows.
    ///
    /// Fails only if the ledger cannot be read. A failed write skips that
    /// row; it is reconsidered on the next cycle.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> LedgerResult<CycleStats> {
        let records = self.ledger.list_records().await?;
        let snapshot = LedgerSnapshot::from_records(&records);
        let planned = plan_transitions(&snapshot);

        debug!(
            records = records.len(),
            deployed = snapshot.deployed_ids.len(),
            waiting_deployment = snapshot.waiting_deployment.len(),
            waiting_removal = snapshot.waiting_removal.len(),
            planned = planned.len(),
            "Ledger snapshot"
        );

        let mut stats = CycleStats {
            records_seen: records.len(),
            ..Default::default()
        };

        for transition in &planned {
            match apply_transition(self.ledger.as_ref(), transition).await {
                Ok(TransitionOutcome::Applied) if transition.to == DeploymentStatus::Deploying => {
                    info!(
                        parent_id = %transition.parent_id,
                        node_id = %transition.node_id,
                        "Deploying a new child"
                    );
                    stats.deploys_started += 1;
                }
                Ok(TransitionOutcome::Applied) => {
                    info!(
                        parent_id = %transition.parent_id,
                        node_id = %transition.node_id,
                        "Removing child node"
                    );
                    stats.removals_started += 1;
                }
                Ok(TransitionOutcome::Conflicted) => stats.conflicts += 1,
                Err(e) => {
                    warn!(
                        node_id = %transition.node_id,
                        error = %e,
                        "Failed to write transition, will retry next cycle"
                    );
                    stats.write_failures += 1;
                }
            }
        }

        Ok(stats)
    }
}
