//! Reconciliation primitives for the lifecycle ledger.
//!
//! This library decides which queued rows may advance, given one snapshot
//! of the ledger. Key concepts:
//!
//! - **Snapshot**: every lifecycle record read in a single pass.
//! - **Deploy readiness**: every `wait_for` node is `DEPLOYED`.
//! - **Removal readiness**: no `wait_for` node is still present at all.
//!
//! # Invariants
//!
//! - Planning is pure and deterministic given the same snapshot
//! - Applying a plan and planning again on the result yields nothing new
//! - Only queued -> in-progress edges are ever planned

use std::collections::{BTreeMap, BTreeSet};

use canopy_ledger::{DeploymentStatus, Ledger, LedgerError, LedgerResult, LifecycleRecord, NodeId};
use tracing::error;

/// One pass over the ledger, partitioned the way the coordinator needs it.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Ids of nodes currently `DEPLOYED`.
    pub deployed_ids: BTreeSet<NodeId>,

    /// Ids of every node with a row, whatever its status.
    pub all_ids: BTreeSet<NodeId>,

    /// Rows in `WAITING_DEPLOYMENT`, ordered by node id.
    pub waiting_deployment: Vec<LifecycleRecord>,

    /// Rows in `WAITING_REMOVAL`, ordered by node id.
    pub waiting_removal: Vec<LifecycleRecord>,
}

impl LedgerSnapshot {
    pub fn from_records(records: &[LifecycleRecord]) -> Self {
        let mut snapshot = Self::default();

        for record in records {
            match record.status {
                DeploymentStatus::Deployed => {
                    snapshot.deployed_ids.insert(record.node_id);
                }
                DeploymentStatus::WaitingDeployment => {
                    snapshot.waiting_deployment.push(record.clone());
                }
                DeploymentStatus::WaitingRemoval => {
                    snapshot.waiting_removal.push(record.clone());
                }
                _ => {}
            }
            snapshot.all_ids.insert(record.node_id);
        }

        snapshot.waiting_deployment.sort_by_key(|r| r.node_id);
        snapshot.waiting_removal.sort_by_key(|r| r.node_id);
        snapshot
    }
}

/// Every node this record waits for is deployed. The `-1` sentinel is
/// always satisfied.
pub fn deploy_ready(record: &LifecycleRecord, snapshot: &LedgerSnapshot) -> bool {
    record
        .wait_for
        .iter()
        .all(|id| id.is_none() || snapshot.deployed_ids.contains(id))
}

/// None of the nodes this record waits for still has a row.
pub fn removal_ready(record: &LifecycleRecord, snapshot: &LedgerSnapshot) -> bool {
    record
        .wait_for
        .iter()
        .all(|id| !snapshot.all_ids.contains(id))
}

/// A status change the coordinator should write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTransition {
    pub node_id: NodeId,
    pub parent_id: NodeId,
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
}

/// Compute every queued -> in-progress transition the snapshot allows.
///
/// Deployments come first, then removals, each ordered by node id.
pub fn plan_transitions(snapshot: &LedgerSnapshot) -> Vec<PlannedTransition> {
    let deploys = snapshot
        .waiting_deployment
        .iter()
        .filter(|r| deploy_ready(r, snapshot))
        .map(|r| PlannedTransition {
            node_id: r.node_id,
            parent_id: r.parent_id,
            from: DeploymentStatus::WaitingDeployment,
            to: DeploymentStatus::Deploying,
        });

    let removals = snapshot
        .waiting_removal
        .iter()
        .filter(|r| removal_ready(r, snapshot))
        .map(|r| PlannedTransition {
            node_id: r.node_id,
            parent_id: r.parent_id,
            from: DeploymentStatus::WaitingRemoval,
            to: DeploymentStatus::Removing,
        });

    deploys.chain(removals).collect()
}

/// Result of writing one planned transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The conditional update matched and was written.
    Applied,
    /// The row was not in the expected state; nothing was written.
    Conflicted,
}

/// Write a planned transition as a conditional update.
///
/// Conflicts mean another writer touched a row that only this actor should
/// own at this point; they are logged at error level and reported as
/// [`TransitionOutcome::Conflicted`] rather than returned as errors.
pub async fn apply_transition(
    ledger: &dyn Ledger,
    planned: &PlannedTransition,
) -> LedgerResult<TransitionOutcome> {
    match ledger
        .transition(planned.node_id, planned.from, planned.to)
        .await
    {
        Ok(()) => Ok(TransitionOutcome::Applied),
        Err(LedgerError::Conflict {
            node_id,
            expected,
            actual,
        }) => {
            error!(
                node_id = %node_id,
                expected = %expected,
                actual = ?actual,
                target = %planned.to,
                "Ledger conflict: row changed under a single-writer edge"
            );
            Ok(TransitionOutcome::Conflicted)
        }
        Err(e) => Err(e),
    }
}

/// Every descendant of `node` in the tree induced by `parent_id`.
///
/// This is the dependency set a removal request must wait for: the node can
/// only be torn down once all of its subtree is gone.
pub fn removal_wait_set(records: &[LifecycleRecord], node: NodeId) -> Vec<NodeId> {
    let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for record in records {
        children
            .entry(record.parent_id)
            .or_default()
            .push(record.node_id);
    }

    let mut seen = BTreeSet::new();
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        for child in children.get(&current).into_iter().flatten() {
            if seen.insert(*child) {
                stack.push(*child);
            }
        }
    }

    seen.remove(&node);
    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_ledger::MemoryLedger;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn record(id: i32, parent: i32, status: DeploymentStatus, wait_for: &[i32]) -> LifecycleRecord {
        LifecycleRecord::new(
            NodeId::new(id),
            NodeId::new(parent),
            status,
            wait_for.iter().copied().map(NodeId::new).collect(),
            Uuid::nil(),
        )
    }

    fn plan(records: &[LifecycleRecord]) -> Vec<PlannedTransition> {
        plan_transitions(&LedgerSnapshot::from_records(records))
    }

    #[test]
    fn test_root_with_sentinel_is_ready() {
        let records = vec![record(1, -1, DeploymentStatus::WaitingDeployment, &[-1])];
        let planned = plan(&records);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].node_id, NodeId::new(1));
        assert_eq!(planned[0].to, DeploymentStatus::Deploying);
    }

    #[test]
    fn test_child_waits_for_deployed_parent() {
        let waiting = record(2, 1, DeploymentStatus::WaitingDeployment, &[1]);

        let parent_deployed = vec![record(1, -1, DeploymentStatus::Deployed, &[-1]), waiting.clone()];
        assert_eq!(plan(&parent_deployed).len(), 1);

        let parent_deploying = vec![record(1, -1, DeploymentStatus::Deploying, &[-1]), waiting];
        assert!(plan(&parent_deploying).is_empty());
    }

    #[test]
    fn test_removal_waits_for_dependents_to_vanish() {
        let removal = record(3, 1, DeploymentStatus::WaitingRemoval, &[4, 5]);
        let mut records = vec![
            record(1, -1, DeploymentStatus::Deployed, &[-1]),
            removal.clone(),
            record(4, 3, DeploymentStatus::ProcessingRemoving, &[-1]),
            record(5, 3, DeploymentStatus::Deployed, &[-1]),
        ];
        assert!(plan(&records).is_empty());

        records.retain(|r| r.node_id != NodeId::new(4));
        assert!(plan(&records).is_empty());

        records.retain(|r| r.node_id != NodeId::new(5));
        let planned = plan(&records);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].node_id, NodeId::new(3));
        assert_eq!(planned[0].to, DeploymentStatus::Removing);
    }

    #[test]
    fn test_failed_dependency_blocks_deploy() {
        let records = vec![
            record(1, -1, DeploymentStatus::Failed, &[-1]),
            record(2, 1, DeploymentStatus::WaitingDeployment, &[1]),
        ];
        assert!(plan(&records).is_empty());
    }

    #[test]
    fn test_removal_wait_set_collects_subtree() {
        let records = vec![
            record(1, -1, DeploymentStatus::Deployed, &[-1]),
            record(2, 1, DeploymentStatus::Deployed, &[1]),
            record(3, 2, DeploymentStatus::Deployed, &[2]),
            record(4, 2, DeploymentStatus::Deployed, &[2]),
            record(5, 1, DeploymentStatus::Deployed, &[1]),
        ];
        assert_eq!(
            removal_wait_set(&records, NodeId::new(2)),
            vec![NodeId::new(3), NodeId::new(4)]
        );
        assert!(removal_wait_set(&records, NodeId::new(4)).is_empty());
    }

    #[tokio::test]
    async fn test_apply_transition_reports_conflict() {
        let ledger = MemoryLedger::new();
        let waiting = record(1, -1, DeploymentStatus::WaitingDeployment, &[-1]);
        ledger.insert_record(&waiting).await.unwrap();

        let planned = plan(&[waiting]);
        assert_eq!(
            apply_transition(&ledger, &planned[0]).await.unwrap(),
            TransitionOutcome::Applied
        );
        // Replaying the same plan against the updated row is rejected.
        assert_eq!(
            apply_transition(&ledger, &planned[0]).await.unwrap(),
            TransitionOutcome::Conflicted
        );
        assert_eq!(
            ledger.status_of(NodeId::new(1)).await,
            Some(DeploymentStatus::Deploying)
        );
    }

    fn arb_status() -> impl Strategy<Value = DeploymentStatus> {
        prop::sample::select(DeploymentStatus::ALL.to_vec())
    }

    /// Up to 8 rows with distinct ids drawn from 0..12, each waiting on a
    /// subset of 0..12 (ids without rows model already-removed nodes).
    fn arb_ledger() -> impl Strategy<Value = Vec<LifecycleRecord>> {
        prop::collection::btree_map(
            0i32..12,
            (arb_status(), prop::collection::btree_set(-1i32..12, 0..4)),
            0..8,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(id, (status, wait_for))| {
                    let wait_for: Vec<i32> = wait_for.into_iter().filter(|w| *w != id).collect();
                    record(id, -1, status, &wait_for)
                })
                .collect()
        })
    }

    fn apply_pure(records: &[LifecycleRecord], planned: &[PlannedTransition]) -> Vec<LifecycleRecord> {
        records
            .iter()
            .map(|r| match planned.iter().find(|p| p.node_id == r.node_id) {
                Some(p) => r.with_status(p.to),
                None => r.clone(),
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_deploy_iff_all_dependencies_deployed(records in arb_ledger()) {
            let planned = plan(&records);
            let deployed: BTreeSet<NodeId> = records
                .iter()
                .filter(|r| r.status == DeploymentStatus::Deployed)
                .map(|r| r.node_id)
                .collect();

            for r in records.iter().filter(|r| r.status == DeploymentStatus::WaitingDeployment) {
                let expected = r.wait_for.iter().all(|w| w.is_none() || deployed.contains(w));
                let got = planned
                    .iter()
                    .any(|p| p.node_id == r.node_id && p.to == DeploymentStatus::Deploying);
                prop_assert_eq!(expected, got);
            }
        }

        #[test]
        fn prop_remove_iff_dependencies_absent(records in arb_ledger()) {
            let planned = plan(&records);
            let present: BTreeSet<NodeId> = records.iter().map(|r| r.node_id).collect();

            for r in records.iter().filter(|r| r.status == DeploymentStatus::WaitingRemoval) {
                let expected = r.wait_for.iter().all(|w| !present.contains(w));
                let got = planned
                    .iter()
                    .any(|p| p.node_id == r.node_id && p.to == DeploymentStatus::Removing);
                prop_assert_eq!(expected, got);
            }
        }

        #[test]
        fn prop_only_queued_rows_are_planned(records in arb_ledger()) {
            for p in plan(&records) {
                prop_assert!(matches!(
                    p.from,
                    DeploymentStatus::WaitingDeployment | DeploymentStatus::WaitingRemoval
                ));
                prop_assert!(p.from.can_transition_to(p.to));
            }
        }

        #[test]
        fn prop_second_pass_plans_nothing(records in arb_ledger()) {
            let first = plan(&records);
            let after = apply_pure(&records, &first);
            prop_assert!(plan(&after).is_empty());
        }
    }
}
