//! Error handling and display for the CLI.

use canopy_ledger::{DeploymentStatus, LedgerError, NodeId};
use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Node {0} not found")]
    NotFound(NodeId),

    #[error("Node {node_id} is {status}; only FAILED nodes can be retried")]
    NotRetryable {
        node_id: NodeId,
        status: DeploymentStatus,
    },

    #[error("Node {node_id} is {status}; only DEPLOYED nodes can be removed")]
    NotRemovable {
        node_id: NodeId,
        status: DeploymentStatus,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NotRetryable {
                status: DeploymentStatus::Deploying | DeploymentStatus::ProcessingDeploying,
                ..
            } => {
                eprintln!(
                    "\n{}",
                    "Hint: The node is already being deployed.".yellow()
                );
            }
            CliError::NotRemovable {
                status: DeploymentStatus::Failed,
                ..
            } => {
                eprintln!(
                    "\n{}",
                    "Hint: Retry the deployment first, then request removal.".yellow()
                );
            }
            CliError::Ledger(LedgerError::Connect(_)) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check DATABASE_URL and that the ledger database is reachable.".yellow()
                );
            }
            _ => {}
        }
    }
}
