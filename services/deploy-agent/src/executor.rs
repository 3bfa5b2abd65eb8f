//! Provisioning and decommissioning of a single claimed node.
//!
//! Each execution opens a session, runs the built sequence strictly in
//! order, closes the session, and writes the row's final status:
//!
//! - deploy: `PROCESSING_DEPLOYING -> DEPLOYED`, or `-> FAILED` on error
//! - remove: the sequence itself deletes the row; on error the row goes
//!   back to `DEPLOYED` so the removal can be requested again
//!
//! A session that cannot be opened counts as a failure. Nothing is retried
//! here; retries are an operator action.

use std::sync::Arc;

use canopy_ledger::{
    DeploymentStatus, Ledger, LifecycleRecord, LogLevel, NodeId, ServerRecord,
};
use canopy_reconcile::{apply_transition, PlannedTransition, TransitionOutcome};
use tracing::{error, info, instrument, warn};

use crate::commands::RemoteCommand;
use crate::error::AgentError;
use crate::sequence::{Mode, Role, SequenceBuilder, SequenceRequest};
use crate::transport::Connector;

/// Addressing of the node this agent runs on, i.e. the parent of every
/// node it deploys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    pub node_id: NodeId,
    pub address: String,
    pub control_port: u16,
    /// Storage port used across the fleet.
    pub storage_port: u16,
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Deployed,
    Failed,
    Removed,
    RolledBack,
    /// The final status could not be written.
    Unrecorded,
}

/// Runs command sequences for claimed rows.
pub struct Executor {
    ledger: Arc<dyn Ledger>,
    connector: Arc<dyn Connector>,
    builder: Arc<dyn SequenceBuilder>,
    local: LocalNode,
}

impl Executor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        connector: Arc<dyn Connector>,
        builder: Arc<dyn SequenceBuilder>,
        local: LocalNode,
    ) -> Self {
        Self {
            ledger,
            connector,
            builder,
            local,
        }
    }

    pub fn request(
        &self,
        record: &LifecycleRecord,
        server: &ServerRecord,
        mode: Mode,
    ) -> SequenceRequest {
        SequenceRequest {
            node_id: record.node_id,
            parent_id: record.parent_id,
            role: Role::for_parent(record.parent_id),
            mode,
            address: server.ip.clone(),
            control_port: server.control_port,
            storage_port: self.local.storage_port,
            parent_address: self.local.address.clone(),
            parent_control_port: self.local.control_port,
            parent_storage_port: self.local.storage_port,
        }
    }

    /// Bring up a node claimed as `PROCESSING_DEPLOYING`.
    #[instrument(skip_all, fields(node_id = %record.node_id, parent_id = %record.parent_id))]
    pub async fn provision(&self, record: &LifecycleRecord, server: &ServerRecord) -> ExecutionOutcome {
        info!(server = %server.name, ip = %server.ip, "Deploying node");

        match self.run(record, server, Mode::Deploy).await {
            Ok(()) => {
                info!("Node deployed");
                self.log(record.node_id, LogLevel::Info, &format!("Deployed on {}", server.name))
                    .await;
                self.finish(
                    record,
                    DeploymentStatus::ProcessingDeploying,
                    DeploymentStatus::Deployed,
                    ExecutionOutcome::Deployed,
                )
                .await
            }
            Err(e) => {
                error!(error = %e, "Deployment failed");
                self.log(record.node_id, LogLevel::Error, &e.to_string())
                    .await;
                self.finish(
                    record,
                    DeploymentStatus::ProcessingDeploying,
                    DeploymentStatus::Failed,
                    ExecutionOutcome::Failed,
                )
                .await
            }
        }
    }

    /// Tear down a node claimed as `PROCESSING_REMOVING`.
    #[instrument(skip_all, fields(node_id = %record.node_id, parent_id = %record.parent_id))]
    pub async fn decommission(
        &self,
        record: &LifecycleRecord,
        server: &ServerRecord,
    ) -> ExecutionOutcome {
        info!(server = %server.name, ip = %server.ip, "Removing node");

        let error = match self.run(record, server, Mode::Remove).await {
            Ok(()) => {
                info!("Node removed");
                return ExecutionOutcome::Removed;
            }
            Err(e) => e,
        };
        error!(error = %error, "Removal failed");

        // Only the auxiliary cleanup after the delete failed; the node is gone.
        if let Ok(None) = self.ledger.get_record(record.node_id).await {
            warn!("Record already deleted, not rolling back");
            return ExecutionOutcome::Removed;
        }

        self.log(record.node_id, LogLevel::Error, &error.to_string())
            .await;
        self.finish(
            record,
            DeploymentStatus::ProcessingRemoving,
            DeploymentStatus::Deployed,
            ExecutionOutcome::RolledBack,
        )
        .await
    }

    async fn run(
        &self,
        record: &LifecycleRecord,
        server: &ServerRecord,
        mode: Mode,
    ) -> Result<(), AgentError> {
        let session = self.connector.connect(server).await?;

        let request = self.request(record, server, mode);
        let commands = self.builder.build(&request, Arc::clone(&session));
        let result = run_sequence(record.node_id, &commands).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close session");
        }
        result
    }

    async fn finish(
        &self,
        record: &LifecycleRecord,
        from: DeploymentStatus,
        to: DeploymentStatus,
        outcome: ExecutionOutcome,
    ) -> ExecutionOutcome {
        let planned = PlannedTransition {
            node_id: record.node_id,
            parent_id: record.parent_id,
            from,
            to,
        };
        match apply_transition(self.ledger.as_ref(), &planned).await {
            Ok(TransitionOutcome::Applied) => outcome,
            Ok(TransitionOutcome::Conflicted) => ExecutionOutcome::Unrecorded,
            Err(e) => {
                error!(error = %e, status = %to, "Failed to record final status");
                ExecutionOutcome::Unrecorded
            }
        }
    }

    async fn log(&self, node_id: NodeId, level: LogLevel, message: &str) {
        if let Err(e) = self.ledger.append_log(node_id, level, message).await {
            warn!(error = %e, "Failed to append node log");
        }
    }
}

/// Run `commands` in order, stopping at the first failure.
pub async fn run_sequence(
    node_id: NodeId,
    commands: &[Box<dyn RemoteCommand>],
) -> Result<(), AgentError> {
    let total = commands.len();
    for (index, command) in commands.iter().enumerate() {
        let step = index + 1;
        info!(node_id = %node_id, step, total, command = %command, "Running command");

        command
            .execute()
            .await
            .map_err(|source| AgentError::Command {
                step,
                command: command.to_string(),
                source,
            })?;
    }
    Ok(())
}
