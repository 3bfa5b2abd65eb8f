//! The agent poll loop.
//!
//! Every `poll_interval` the agent reads the rows whose parent is its own
//! node, claims those the coordinator moved to `DEPLOYING` or `REMOVING`,
//! and hands each claimed row to a bounded pool of executions. The loop
//! itself never waits on an execution.

use std::sync::Arc;
use std::time::Duration;

use canopy_ledger::{DeploymentStatus, Ledger, LedgerResult, LifecycleRecord, NodeId};
use canopy_reconcile::{apply_transition, PlannedTransition, TransitionOutcome};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::AgentError;
use crate::executor::{ExecutionOutcome, Executor};

/// Loop settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub node_id: NodeId,
    pub poll_interval: Duration,
    pub max_concurrent_executions: usize,
}

/// Statistics from one poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    pub claimed: usize,
    /// Rows left for a later poll because every execution slot was taken.
    pub skipped_busy: usize,
    pub conflicts: usize,
}

/// Per-node agent.
pub struct Agent {
    settings: AgentSettings,
    ledger: Arc<dyn Ledger>,
    executor: Arc<Executor>,
    pool: Arc<Semaphore>,
    executions: Mutex<JoinSet<ExecutionOutcome>>,
}

impl Agent {
    pub fn new(settings: AgentSettings, ledger: Arc<dyn Ledger>, executor: Arc<Executor>) -> Self {
        let pool = Arc::new(Semaphore::new(settings.max_concurrent_executions.max(1)));
        Self {
            settings,
            ledger,
            executor,
            pool,
            executions: Mutex::new(JoinSet::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.settings.node_id
    }

    /// Execution slots currently free.
    pub fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }

    /// Children left in a `PROCESSING_*` state, e.g. by a previous agent
    /// process that died mid-execution.
    pub async fn stale_claims(&self) -> LedgerResult<Vec<LifecycleRecord>> {
        Ok(self
            .ledger
            .children_of(self.settings.node_id)
            .await?
            .into_iter()
            .filter(|r| r.status.is_processing())
            .collect())
    }

    /// Claim and dispatch every runnable child.
    #[instrument(skip(self), fields(node_id = %self.settings.node_id))]
    pub async fn poll_once(&self) -> Result<PollStats, AgentError> {
        self.reap().await;

        let children = self.ledger.children_of(self.settings.node_id).await?;
        let mut stats = PollStats::default();

        for record in children {
            let Some(claimed) = record.status.claimed() else {
                continue;
            };

            let permit = match Arc::clone(&self.pool).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(child = %record.node_id, "No free execution slot, leaving for next poll");
                    stats.skipped_busy += 1;
                    continue;
                }
            };

            let server = match self.ledger.get_server(record.server_ref).await {
                Ok(Some(server)) => server,
                Ok(None) => {
                    error!(
                        child = %record.node_id,
                        server_ref = %record.server_ref,
                        "Server record not found"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(child = %record.node_id, error = %e, "Failed to resolve server record");
                    continue;
                }
            };

            let planned = PlannedTransition {
                node_id: record.node_id,
                parent_id: record.parent_id,
                from: record.status,
                to: claimed,
            };
            match apply_transition(self.ledger.as_ref(), &planned).await {
                Ok(TransitionOutcome::Applied) => {}
                Ok(TransitionOutcome::Conflicted) => {
                    stats.conflicts += 1;
                    continue;
                }
                Err(e) => {
                    warn!(child = %record.node_id, error = %e, "Failed to claim row");
                    continue;
                }
            }

            info!(child = %record.node_id, status = %claimed, server = %server.name, "Claimed row");
            stats.claimed += 1;

            let executor = Arc::clone(&self.executor);
            let record = record.with_status(claimed);
            self.executions.lock().await.spawn(async move {
                let outcome = if claimed == DeploymentStatus::ProcessingDeploying {
                    executor.provision(&record, &server).await
                } else {
                    executor.decommission(&record, &server).await
                };
                drop(permit);
                outcome
            });
        }

        Ok(stats)
    }

    /// Run until shutdown, then wait for in-flight executions.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node_id = %self.settings.node_id,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_concurrent_executions = self.settings.max_concurrent_executions,
            "Starting agent"
        );

        self.report_stale_claims().await;

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(stats) if stats.claimed > 0 || stats.skipped_busy > 0 => {
                            info!(
                                claimed = stats.claimed,
                                skipped_busy = stats.skipped_busy,
                                conflicts = stats.conflicts,
                                "Agent poll complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Agent poll failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Agent shutting down");
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Wait for every in-flight execution to finish.
    pub async fn drain(&self) {
        let mut executions = self.executions.lock().await;
        if !executions.is_empty() {
            info!(in_flight = executions.len(), "Waiting for executions to finish");
        }
        while let Some(result) = executions.join_next().await {
            log_finished(result);
        }
    }

    async fn reap(&self) {
        let mut executions = self.executions.lock().await;
        while let Some(result) = executions.try_join_next() {
            log_finished(result);
        }
    }

    async fn report_stale_claims(&self) {
        match self.stale_claims().await {
            Ok(stale) => {
                for record in stale {
                    warn!(
                        child = %record.node_id,
                        status = %record.status,
                        "Row was claimed by an earlier run and is not being processed; needs operator attention"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to check for stale claims"),
        }
    }
}

fn log_finished(result: Result<ExecutionOutcome, tokio::task::JoinError>) {
    match result {
        Ok(outcome) => debug!(?outcome, "Execution finished"),
        Err(e) => error!(error = %e, "Execution task panicked"),
    }
}
