//! In-memory ledger.
//!
//! Each operation takes the lock once, which gives the same per-row
//! atomicity the database ledger offers. Used by tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::store::Ledger;
use crate::types::{
    DeploymentStatus, LifecycleRecord, LogLevel, NodeId, NodeLogRecord, ServerRecord,
};

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<NodeId, LifecycleRecord>,
    servers: HashMap<Uuid, ServerRecord>,
    logs: Vec<NodeLogRecord>,
}

/// Ledger held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a row without any state machine checks.
    pub async fn force_record(&self, record: LifecycleRecord) {
        self.tables
            .write()
            .await
            .records
            .insert(record.node_id, record);
    }

    /// Current status of a node, `None` once the row is gone.
    pub async fn status_of(&self, node_id: NodeId) -> Option<DeploymentStatus> {
        self.tables
            .read()
            .await
            .records
            .get(&node_id)
            .map(|r| r.status)
    }

    fn check_available(&self) -> LedgerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable(
                "in-memory ledger marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn list_records(&self) -> LedgerResult<Vec<LifecycleRecord>> {
        self.check_available()?;
        Ok(self.tables.read().await.records.values().cloned().collect())
    }

    async fn children_of(&self, parent: NodeId) -> LedgerResult<Vec<LifecycleRecord>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .await
            .records
            .values()
            .filter(|r| r.parent_id == parent)
            .cloned()
            .collect())
    }

    async fn get_record(&self, node_id: NodeId) -> LedgerResult<Option<LifecycleRecord>> {
        self.check_available()?;
        Ok(self.tables.read().await.records.get(&node_id).cloned())
    }

    async fn insert_record(&self, record: &LifecycleRecord) -> LedgerResult<()> {
        self.check_available()?;
        record.validate().map_err(LedgerError::InvalidRecord)?;

        let mut tables = self.tables.write().await;
        if tables.records.contains_key(&record.node_id) {
            return Err(LedgerError::Duplicate(record.node_id));
        }
        tables.records.insert(record.node_id, record.clone());
        Ok(())
    }

    async fn transition(
        &self,
        node_id: NodeId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
    ) -> LedgerResult<()> {
        self.check_available()?;
        if !expected.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let mut tables = self.tables.write().await;
        match tables.records.get_mut(&node_id) {
            Some(record) if record.status == expected => {
                record.status = next;
                Ok(())
            }
            other => Err(LedgerError::Conflict {
                node_id,
                expected,
                actual: other.map(|r| r.status),
            }),
        }
    }

    async fn request_removal(&self, node_id: NodeId, wait_for: &[NodeId]) -> LedgerResult<()> {
        self.check_available()?;

        let mut tables = self.tables.write().await;
        match tables.records.get_mut(&node_id) {
            Some(record) if record.status == DeploymentStatus::Deployed => {
                record.status = DeploymentStatus::WaitingRemoval;
                record.wait_for = wait_for.to_vec();
                Ok(())
            }
            other => Err(LedgerError::Conflict {
                node_id,
                expected: DeploymentStatus::Deployed,
                actual: other.map(|r| r.status),
            }),
        }
    }

    async fn delete_record(&self, node_id: NodeId) -> LedgerResult<()> {
        self.check_available()?;
        self.tables
            .write()
            .await
            .records
            .remove(&node_id)
            .map(|_| ())
            .ok_or(LedgerError::NotFound(node_id))
    }

    async fn get_server(&self, server_uuid: Uuid) -> LedgerResult<Option<ServerRecord>> {
        self.check_available()?;
        Ok(self.tables.read().await.servers.get(&server_uuid).cloned())
    }

    async fn upsert_server(&self, server: &ServerRecord) -> LedgerResult<()> {
        self.check_available()?;
        self.tables
            .write()
            .await
            .servers
            .insert(server.server_uuid, server.clone());
        Ok(())
    }

    async fn append_log(
        &self,
        node_id: NodeId,
        level: LogLevel,
        message: &str,
    ) -> LedgerResult<()> {
        self.check_available()?;
        self.tables.write().await.logs.push(NodeLogRecord {
            node_id,
            level,
            message: message.to_string(),
            logged_at: Utc::now(),
        });
        Ok(())
    }

    async fn logs_for(&self, node_id: NodeId) -> LedgerResult<Vec<NodeLogRecord>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .await
            .logs
            .iter()
            .filter(|l| l.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn purge_node_state(&self, node_id: NodeId) -> LedgerResult<u64> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let before = tables.logs.len();
        tables.logs.retain(|l| l.node_id != node_id);
        Ok((before - tables.logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i32, parent: i32, status: DeploymentStatus) -> LifecycleRecord {
        LifecycleRecord::new(
            NodeId::new(id),
            NodeId::new(parent),
            status,
            vec![NodeId::NONE],
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let ledger = MemoryLedger::new();
        let root = record(1, -1, DeploymentStatus::WaitingDeployment);

        ledger.insert_record(&root).await.unwrap();
        let err = ledger.insert_record(&root).await.unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate(id) if id == NodeId::new(1)));
    }

    #[tokio::test]
    async fn test_insert_rejects_self_parent() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .insert_record(&record(3, 3, DeploymentStatus::WaitingDeployment))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let ledger = MemoryLedger::new();
        ledger
            .insert_record(&record(1, -1, DeploymentStatus::Deploying))
            .await
            .unwrap();

        ledger
            .transition(
                NodeId::new(1),
                DeploymentStatus::Deploying,
                DeploymentStatus::ProcessingDeploying,
            )
            .await
            .unwrap();

        // A second claim on the same row is rejected.
        let err = ledger
            .transition(
                NodeId::new(1),
                DeploymentStatus::Deploying,
                DeploymentStatus::ProcessingDeploying,
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            ledger.status_of(NodeId::new(1)).await,
            Some(DeploymentStatus::ProcessingDeploying)
        );
    }

    #[tokio::test]
    async fn test_transition_rejects_unknown_edges() {
        let ledger = MemoryLedger::new();
        ledger
            .insert_record(&record(1, -1, DeploymentStatus::ProcessingRemoving))
            .await
            .unwrap();

        let err = ledger
            .transition(
                NodeId::new(1),
                DeploymentStatus::ProcessingRemoving,
                DeploymentStatus::Failed,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_on_missing_row_conflicts() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .transition(
                NodeId::new(9),
                DeploymentStatus::ProcessingRemoving,
                DeploymentStatus::Deployed,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { actual: None, .. }));
    }

    #[tokio::test]
    async fn test_children_of_filters_by_parent() {
        let ledger = MemoryLedger::new();
        ledger
            .insert_record(&record(1, -1, DeploymentStatus::Deployed))
            .await
            .unwrap();
        ledger
            .insert_record(&record(2, 1, DeploymentStatus::Deploying))
            .await
            .unwrap();
        ledger
            .insert_record(&record(3, 2, DeploymentStatus::WaitingDeployment))
            .await
            .unwrap();

        let children = ledger.children_of(NodeId::new(1)).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].node_id, NodeId::new(2));
    }

    #[tokio::test]
    async fn test_request_removal_requires_deployed() {
        let ledger = MemoryLedger::new();
        ledger
            .insert_record(&record(2, 1, DeploymentStatus::Failed))
            .await
            .unwrap();
        assert!(ledger
            .request_removal(NodeId::new(2), &[NodeId::new(4)])
            .await
            .unwrap_err()
            .is_conflict());

        ledger
            .force_record(record(2, 1, DeploymentStatus::Deployed))
            .await;
        ledger
            .request_removal(NodeId::new(2), &[NodeId::new(4)])
            .await
            .unwrap();

        let row = ledger.get_record(NodeId::new(2)).await.unwrap().unwrap();
        assert_eq!(row.status, DeploymentStatus::WaitingRemoval);
        assert_eq!(row.wait_for, vec![NodeId::new(4)]);
    }

    #[tokio::test]
    async fn test_purge_only_touches_one_node() {
        let ledger = MemoryLedger::new();
        ledger
            .append_log(NodeId::new(2), LogLevel::Error, "boom")
            .await
            .unwrap();
        ledger
            .append_log(NodeId::new(2), LogLevel::Info, "retrying")
            .await
            .unwrap();
        ledger
            .append_log(NodeId::new(3), LogLevel::Info, "ok")
            .await
            .unwrap();

        assert_eq!(ledger.purge_node_state(NodeId::new(2)).await.unwrap(), 2);
        assert!(ledger.logs_for(NodeId::new(2)).await.unwrap().is_empty());
        assert_eq!(ledger.logs_for(NodeId::new(3)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_ledger_fails_reads() {
        let ledger = MemoryLedger::new();
        ledger.set_unavailable(true);
        assert!(matches!(
            ledger.list_records().await,
            Err(LedgerError::Unavailable(_))
        ));
        ledger.set_unavailable(false);
        assert!(ledger.list_records().await.unwrap().is_empty());
    }
}
