//! Operator retry of a failed deployment.

use anyhow::Result;
use canopy_ledger::{DeploymentStatus, Ledger, LedgerError, LifecycleRecord, NodeId};
use clap::Args;

use crate::error::CliError;
use crate::output::print_result;

use super::CommandContext;

/// Move a FAILED node back to DEPLOYING so its parent's agent picks it up.
#[derive(Debug, Args)]
pub struct RetryCommand {
    /// Node ID.
    node: NodeId,
}

impl RetryCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let ledger = ctx.ledger().await?;
        let record = retry_node(ledger.as_ref(), self.node).await?;
        print_result(
            &format!(
                "Node {} queued for redeployment by the agent on node {}",
                record.node_id, record.parent_id
            ),
            &record,
            ctx.format,
        );
        Ok(())
    }
}

/// Conditional `FAILED -> DEPLOYING`.
pub async fn retry_node(ledger: &dyn Ledger, node_id: NodeId) -> Result<LifecycleRecord, CliError> {
    let record = ledger
        .get_record(node_id)
        .await?
        .ok_or(CliError::NotFound(node_id))?;

    if record.status != DeploymentStatus::Failed {
        return Err(CliError::NotRetryable {
            node_id,
            status: record.status,
        });
    }

    match ledger
        .transition(node_id, DeploymentStatus::Failed, DeploymentStatus::Deploying)
        .await
    {
        Ok(()) => Ok(record.with_status(DeploymentStatus::Deploying)),
        Err(LedgerError::Conflict {
            actual: Some(status),
            ..
        }) => Err(CliError::NotRetryable { node_id, status }),
        Err(LedgerError::Conflict { actual: None, .. }) => Err(CliError::NotFound(node_id)),
        Err(e) => Err(e.into()),
    }
}
