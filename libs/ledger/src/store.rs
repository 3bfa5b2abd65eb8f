//! The `Ledger` access trait.
//!
//! The ledger is the only coordination medium between the coordinator and
//! the agents. Rows are updated one at a time; there is no cross-row
//! transaction. Every status write goes through [`Ledger::transition`], a
//! conditional update on the expected prior status, so a racing writer is
//! rejected with [`LedgerError::Conflict`] instead of silently overwriting.
//!
//! [`LedgerError::Conflict`]: crate::LedgerError::Conflict

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::types::{
    DeploymentStatus, LifecycleRecord, LogLevel, NodeId, NodeLogRecord, ServerRecord,
};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Every lifecycle record, ordered by node id.
    async fn list_records(&self) -> LedgerResult<Vec<LifecycleRecord>>;

    /// Records whose parent is `parent`, ordered by node id.
    async fn children_of(&self, parent: NodeId) -> LedgerResult<Vec<LifecycleRecord>>;

    async fn get_record(&self, node_id: NodeId) -> LedgerResult<Option<LifecycleRecord>>;

    /// Create a record. Rejects duplicates and structurally invalid rows.
    async fn insert_record(&self, record: &LifecycleRecord) -> LedgerResult<()>;

    /// Move `node_id` from `expected` to `next`.
    ///
    /// Fails with `InvalidTransition` if the edge does not exist and with
    /// `Conflict` if the row is missing or not currently in `expected`.
    async fn transition(
        &self,
        node_id: NodeId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
    ) -> LedgerResult<()>;

    /// Rewrite a `DEPLOYED` row to `WAITING_REMOVAL` with a new dependency set.
    async fn request_removal(&self, node_id: NodeId, wait_for: &[NodeId]) -> LedgerResult<()>;

    /// Permanently remove the row.
    async fn delete_record(&self, node_id: NodeId) -> LedgerResult<()>;

    async fn get_server(&self, server_uuid: Uuid) -> LedgerResult<Option<ServerRecord>>;

    async fn upsert_server(&self, server: &ServerRecord) -> LedgerResult<()>;

    async fn append_log(&self, node_id: NodeId, level: LogLevel, message: &str)
        -> LedgerResult<()>;

    /// Log lines for a node, oldest first.
    async fn logs_for(&self, node_id: NodeId) -> LedgerResult<Vec<NodeLogRecord>>;

    /// Delete auxiliary state tied to the node. Returns the number of rows removed.
    async fn purge_node_state(&self, node_id: NodeId) -> LedgerResult<u64>;
}
