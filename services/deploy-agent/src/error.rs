//! Agent errors.

use canopy_ledger::LedgerError;
use thiserror::Error;

use crate::commands::CommandError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A command in the sequence failed; the rest were not run.
    #[error("step {step} failed ({command}): {source}")]
    Command {
        step: usize,
        command: String,
        #[source]
        source: CommandError,
    },
}
