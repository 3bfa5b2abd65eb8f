//! Fleet status.

use std::collections::BTreeMap;

use anyhow::Result;
use canopy_ledger::{DeploymentStatus, LifecycleRecord};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, OutputFormat};

use super::CommandContext;

/// Show lifecycle records.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Only show records in this status (e.g. FAILED).
    #[arg(long)]
    status: Option<DeploymentStatus>,

    /// Only show children of this node.
    #[arg(long)]
    parent: Option<i32>,
}

impl StatusCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let ledger = ctx.ledger().await?;
        let records = ledger.list_records().await?;

        let rows = status_rows(&records, self.status, self.parent);
        print_output(&rows, ctx.format);

        if ctx.format == OutputFormat::Table && !rows.is_empty() {
            println!("{}", summary(&records));
        }
        Ok(())
    }
}

/// One lifecycle record as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Tabled)]
pub struct StatusRow {
    #[tabled(rename = "Node")]
    pub node_id: i32,

    #[tabled(rename = "Parent")]
    pub parent_id: i32,

    #[tabled(rename = "Status")]
    pub status: DeploymentStatus,

    #[tabled(rename = "Waits For", display = "display_ids")]
    pub wait_for: Vec<i32>,

    #[tabled(rename = "Server")]
    pub server_ref: String,
}

fn display_ids(ids: &Vec<i32>) -> String {
    let shown: Vec<String> = ids
        .iter()
        .filter(|id| **id >= 0)
        .map(|id| id.to_string())
        .collect();
    if shown.is_empty() {
        "-".to_string()
    } else {
        shown.join(",")
    }
}

pub fn status_rows(
    records: &[LifecycleRecord],
    status: Option<DeploymentStatus>,
    parent: Option<i32>,
) -> Vec<StatusRow> {
    records
        .iter()
        .filter(|r| status.is_none_or(|s| r.status == s))
        .filter(|r| parent.is_none_or(|p| r.parent_id.get() == p))
        .map(|r| StatusRow {
            node_id: r.node_id.get(),
            parent_id: r.parent_id.get(),
            status: r.status,
            wait_for: r.wait_for.iter().map(|id| id.get()).collect(),
            server_ref: r.server_ref.to_string(),
        })
        .collect()
}

fn summary(records: &[LifecycleRecord]) -> String {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.status.as_str()).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(status, count)| {
            let text = format!("{count} {status}");
            match status {
                "DEPLOYED" => text.green().to_string(),
                "FAILED" => text.red().to_string(),
                _ => text.yellow().to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
