//! Ledger error types.

use thiserror::Error;

use crate::types::{DeploymentStatus, NodeId};

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger operation errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Failed to connect to the backing database.
    #[error("failed to connect to ledger database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("ledger query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// The ledger cannot currently be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// No row exists for the node.
    #[error("no lifecycle record for node {0}")]
    NotFound(NodeId),

    /// A row for the node already exists.
    #[error("lifecycle record for node {0} already exists")]
    Duplicate(NodeId),

    /// Conditional update rejected: the row was not in the expected state.
    #[error("conflict on node {node_id}: expected {expected}, found {}", display_actual(.actual))]
    Conflict {
        node_id: NodeId,
        expected: DeploymentStatus,
        actual: Option<DeploymentStatus>,
    },

    /// The requested edge is not part of the state machine.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    /// The record failed structural validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A stored value could not be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

fn display_actual(actual: &Option<DeploymentStatus>) -> String {
    actual
        .map(|s| s.to_string())
        .unwrap_or_else(|| "no row".to_string())
}

impl LedgerError {
    /// Returns true for a rejected conditional update.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
