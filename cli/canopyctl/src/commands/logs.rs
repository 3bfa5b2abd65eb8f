//! Node log lines.

use anyhow::Result;
use canopy_ledger::{NodeId, NodeLogRecord};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::output::print_output;

use super::CommandContext;

/// Show log lines recorded for a node.
#[derive(Debug, Args)]
pub struct LogsCommand {
    /// Node ID.
    node: NodeId,

    /// Only show the last N lines.
    #[arg(long)]
    tail: Option<usize>,
}

impl LogsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let ledger = ctx.ledger().await?;
        let logs = ledger.logs_for(self.node).await?;
        print_output(&log_rows(&logs, self.tail), ctx.format);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct LogRow {
    #[tabled(rename = "Time")]
    pub logged_at: String,

    #[tabled(rename = "Level")]
    pub level: String,

    #[tabled(rename = "Message")]
    pub message: String,
}

pub fn log_rows(logs: &[NodeLogRecord], tail: Option<usize>) -> Vec<LogRow> {
    let skip = tail.map_or(0, |n| logs.len().saturating_sub(n));
    logs.iter()
        .skip(skip)
        .map(|l| LogRow {
            logged_at: l.logged_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            level: l.level.as_str().to_uppercase(),
            message: l.message.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_ledger::LogLevel;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_log_rows_tail() {
        let logs: Vec<NodeLogRecord> = (0..5)
            .map(|i| NodeLogRecord {
                node_id: NodeId::new(2),
                level: LogLevel::Error,
                message: format!("line {i}"),
                logged_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, i).unwrap(),
            })
            .collect();

        let rows = log_rows(&logs, Some(2));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "line 3");
        assert_eq!(rows[1].logged_at, "2024-03-01T12:00:04Z");
        assert_eq!(rows[1].level, "ERROR");

        assert_eq!(log_rows(&logs, None).len(), 5);
        assert_eq!(log_rows(&logs, Some(10)).len(), 5);
    }
}
