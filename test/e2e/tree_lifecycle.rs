//! End-to-end tree lifecycle tests.
//!
//! Runs the coordinator worker and one agent per parent node against a
//! shared in-memory ledger and the mock transport, validating:
//!
//! 1. A whole tree deploys top-down
//! 2. Removing the whole tree tears it down bottom-up and empties the ledger
//! 3. A failed deployment stays FAILED until an operator retries it
//!
//! ## Running
//!
//! ```bash
//! cargo test -p canopy-e2e --test tree_lifecycle
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use canopy_agent::{
    Agent, AgentSettings, ContainerSequenceBuilder, Executor, InstallLayout, LocalNode,
    MockConnector,
};
use canopy_coordinator::CoordinatorWorker;
use canopy_ledger::{
    DeploymentStatus, Ledger, LifecycleRecord, LogLevel, MemoryLedger, NodeId, ServerAuth,
    ServerRecord,
};
use canopy_reconcile::removal_wait_set;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// A running fleet: coordinator plus agents for the given parent nodes.
struct Fleet {
    ledger: Arc<MemoryLedger>,
    connector: MockConnector,
    control_port: u16,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    _staging: TempDir,
    _listeners: Vec<TcpListener>,
}

impl Fleet {
    async fn start(parents: &[i32]) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let ledger = Arc::new(MemoryLedger::new());
        let connector = MockConnector::new();
        let staging = tempfile::tempdir().unwrap();

        // Every node shares one host in this harness, so one pair of
        // listeners answers all readiness checks.
        let storage = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let storage_port = storage.local_addr().unwrap().port();
        let control_port = control.local_addr().unwrap().port();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let worker = CoordinatorWorker::new(ledger.clone(), Duration::from_millis(10));
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(rx).await }));

        for &parent in parents {
            let builder = ContainerSequenceBuilder::new(
                InstallLayout {
                    install_dir: "canopy-install".to_string(),
                    staging_dir: staging.path().to_path_buf(),
                    docker_files_dir: PathBuf::from("docker-files"),
                    branch: "main".to_string(),
                    readiness_attempts: 5,
                    readiness_interval: Duration::from_millis(10),
                },
                ledger.clone(),
            );
            let executor = Executor::new(
                ledger.clone(),
                Arc::new(connector.clone()),
                Arc::new(builder),
                LocalNode {
                    node_id: NodeId::new(parent),
                    address: "127.0.0.1".to_string(),
                    control_port,
                    storage_port,
                },
            );
            let agent = Arc::new(Agent::new(
                AgentSettings {
                    node_id: NodeId::new(parent),
                    poll_interval: Duration::from_millis(10),
                    max_concurrent_executions: 4,
                },
                ledger.clone(),
                Arc::new(executor),
            ));
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { agent.run(rx).await }));
        }

        Self {
            ledger,
            connector,
            control_port,
            shutdown,
            tasks,
            _staging: staging,
            _listeners: vec![storage, control],
        }
    }

    /// Queue a node for deployment under `parent`.
    async fn add_node(&self, id: i32, parent: i32) {
        let server = ServerRecord {
            server_uuid: Uuid::new_v4(),
            ip: "127.0.0.1".to_string(),
            username: "canopy".to_string(),
            auth: ServerAuth::Identity {
                private_key_path: "/keys/id_ed25519".to_string(),
                passphrase: None,
            },
            ssh_port: 22,
            control_port: self.control_port,
            name: format!("node-{id}"),
        };
        self.ledger.upsert_server(&server).await.unwrap();
        self.ledger
            .insert_record(&LifecycleRecord::new(
                NodeId::new(id),
                NodeId::new(parent),
                DeploymentStatus::WaitingDeployment,
                vec![NodeId::new(parent)],
                server.server_uuid,
            ))
            .await
            .unwrap();
    }

    async fn statuses(&self) -> BTreeMap<i32, DeploymentStatus> {
        self.ledger
            .list_records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.node_id.get(), r.status))
            .collect()
    }

    /// Poll the ledger until `done` holds, checking `invariant` on every
    /// observed state.
    async fn wait_until(
        &self,
        what: &str,
        done: impl Fn(&BTreeMap<i32, DeploymentStatus>) -> bool,
        invariant: impl Fn(&BTreeMap<i32, DeploymentStatus>),
    ) {
        let start = std::time::Instant::now();
        loop {
            let statuses = self.statuses().await;
            invariant(&statuses);
            if done(&statuses) {
                return;
            }
            if start.elapsed() > STEP_TIMEOUT {
                panic!("timed out waiting for {what}; ledger: {statuses:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for task in self.tasks {
            tokio::time::timeout(STEP_TIMEOUT, task)
                .await
                .expect("task did not stop")
                .unwrap();
        }
    }
}

/// Edges of the test tree: (node, parent).
const TREE: [(i32, i32); 5] = [(1, -1), (2, 1), (3, 1), (4, 3), (5, 3)];

fn parent_of(id: i32) -> i32 {
    TREE.iter()
        .find(|(node, _)| *node == id)
        .map(|(_, parent)| *parent)
        .unwrap()
}

/// A node only gets past WAITING_DEPLOYMENT/DEPLOYING once its parent is
/// deployed, and never outlives its parent.
fn assert_tree_order(statuses: &BTreeMap<i32, DeploymentStatus>) {
    for (&id, &status) in statuses {
        let parent = parent_of(id);
        if parent == -1 {
            continue;
        }
        match statuses.get(&parent) {
            None => panic!("node {id} exists but its parent {parent} is gone: {statuses:?}"),
            Some(parent_status) => {
                if matches!(
                    status,
                    DeploymentStatus::ProcessingDeploying | DeploymentStatus::Deployed
                ) && statuses.len() == TREE.len()
                {
                    assert!(
                        matches!(
                            parent_status,
                            DeploymentStatus::Deployed
                                | DeploymentStatus::WaitingRemoval
                                | DeploymentStatus::Removing
                                | DeploymentStatus::ProcessingRemoving
                        ),
                        "node {id} is {status} while parent {parent} is {parent_status}"
                    );
                }
            }
        }
    }
}

#[tokio::test]
async fn test_tree_deploys_top_down_and_removes_bottom_up() {
    let fleet = Fleet::start(&[-1, 1, 3]).await;
    for (id, parent) in TREE {
        fleet.add_node(id, parent).await;
    }

    fleet
        .wait_until(
            "every node to deploy",
            |s| s.len() == TREE.len() && s.values().all(|st| *st == DeploymentStatus::Deployed),
            assert_tree_order,
        )
        .await;

    // Request removal of the whole tree, each node waiting on its subtree.
    let records = fleet.ledger.list_records().await.unwrap();
    for (id, _) in TREE {
        let mut wait_for = removal_wait_set(&records, NodeId::new(id));
        if wait_for.is_empty() {
            wait_for.push(NodeId::NONE);
        }
        fleet
            .ledger
            .request_removal(NodeId::new(id), &wait_for)
            .await
            .unwrap();
    }

    fleet
        .wait_until("the ledger to empty", |s| s.is_empty(), assert_tree_order)
        .await;

    // Purging and closing the session follow the row delete, so let the
    // agents drain before looking at either.
    let ledger = fleet.ledger.clone();
    let connector = fleet.connector.clone();
    fleet.stop().await;

    for (id, _) in TREE {
        assert!(ledger.logs_for(NodeId::new(id)).await.unwrap().is_empty());
    }
    assert_eq!(connector.sessions_opened(), 2 * TREE.len());
    assert_eq!(connector.sessions_closed(), 2 * TREE.len());

    let executed = connector.executed();
    assert_eq!(
        executed.iter().filter(|c| *c == "docker ps").count(),
        TREE.len()
    );
    // Once as stale cleanup before each deploy, once per removal.
    assert_eq!(
        executed
            .iter()
            .filter(|c| *c == "docker kill canopy-overlay")
            .count(),
        2 * TREE.len()
    );
}

#[tokio::test]
async fn test_failed_deployment_waits_for_operator_retry() {
    let fleet = Fleet::start(&[-1, 1]).await;
    fleet.add_node(1, -1).await;
    fleet
        .wait_until(
            "root to deploy",
            |s| s.get(&1) == Some(&DeploymentStatus::Deployed),
            |_| {},
        )
        .await;

    fleet.connector.fail_on("docker ps");
    fleet.add_node(2, 1).await;
    fleet
        .wait_until(
            "node 2 to fail",
            |s| s.get(&2) == Some(&DeploymentStatus::Failed),
            |_| {},
        )
        .await;

    let logs = fleet.ledger.logs_for(NodeId::new(2)).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Error);
    assert!(logs[0].message.contains("docker ps"));

    // Nothing retries on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        fleet.ledger.status_of(NodeId::new(2)).await,
        Some(DeploymentStatus::Failed)
    );

    fleet.connector.clear_failures();
    fleet
        .ledger
        .transition(
            NodeId::new(2),
            DeploymentStatus::Failed,
            DeploymentStatus::Deploying,
        )
        .await
        .unwrap();

    fleet
        .wait_until(
            "node 2 to deploy after retry",
            |s| s.get(&2) == Some(&DeploymentStatus::Deployed),
            |_| {},
        )
        .await;

    fleet.stop().await;
}
