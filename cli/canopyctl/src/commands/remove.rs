//! Removal requests.
//!
//! A removal rewrites a `DEPLOYED` row to `WAITING_REMOVAL` with every
//! descendant as its dependency set, so the coordinator only releases it
//! once the whole subtree below it is gone.

use anyhow::Result;
use canopy_ledger::{DeploymentStatus, Ledger, LedgerError, NodeId};
use canopy_reconcile::removal_wait_set;
use clap::Args;
use serde::Serialize;

use crate::error::CliError;
use crate::output::{print_info, print_result, OutputFormat};

use super::CommandContext;

/// Request removal of a node.
#[derive(Debug, Args)]
pub struct RemoveCommand {
    /// Node ID.
    node: NodeId,

    /// Also request removal of every deployed node below it.
    #[arg(long)]
    subtree: bool,
}

impl RemoveCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let ledger = ctx.ledger().await?;
        let report = request_removal(ledger.as_ref(), self.node, self.subtree).await?;

        if ctx.format == OutputFormat::Table {
            for (node_id, status) in &report.skipped {
                print_info(&format!("Node {node_id} is {status}, not requesting its removal"));
            }
        }
        print_result(
            &format!("Removal requested for {} node(s)", report.requested.len()),
            &report,
            ctx.format,
        );
        Ok(())
    }
}

/// Outcome of a removal request.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    /// Nodes moved to `WAITING_REMOVAL`, with the nodes each waits for.
    pub requested: Vec<(NodeId, Vec<NodeId>)>,
    /// Descendants left alone because they were not deployed.
    pub skipped: Vec<(NodeId, DeploymentStatus)>,
}

pub async fn request_removal(
    ledger: &dyn Ledger,
    node_id: NodeId,
    subtree: bool,
) -> Result<RemovalReport, CliError> {
    let records = ledger.list_records().await?;
    let target = records
        .iter()
        .find(|r| r.node_id == node_id)
        .ok_or(CliError::NotFound(node_id))?;
    if target.status != DeploymentStatus::Deployed {
        return Err(CliError::NotRemovable {
            node_id,
            status: target.status,
        });
    }

    let mut targets = vec![node_id];
    if subtree {
        targets.extend(removal_wait_set(&records, node_id));
    }

    let mut report = RemovalReport::default();
    for id in targets {
        let Some(record) = records.iter().find(|r| r.node_id == id) else {
            continue;
        };
        if record.status != DeploymentStatus::Deployed {
            report.skipped.push((id, record.status));
            continue;
        }

        let mut wait_for = removal_wait_set(&records, id);
        if wait_for.is_empty() {
            wait_for.push(NodeId::NONE);
        }

        match ledger.request_removal(id, &wait_for).await {
            Ok(()) => report.requested.push((id, wait_for)),
            Err(LedgerError::Conflict {
                actual: Some(status),
                ..
            }) if id != node_id => report.skipped.push((id, status)),
            Err(LedgerError::Conflict {
                actual: Some(status),
                ..
            }) => return Err(CliError::NotRemovable { node_id, status }),
            Err(LedgerError::Conflict { actual: None, .. }) if id == node_id => {
                return Err(CliError::NotFound(node_id))
            }
            Err(LedgerError::Conflict { actual: None, .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(report)
}
