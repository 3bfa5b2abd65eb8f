//! Lifecycle record model.
//!
//! One [`LifecycleRecord`] exists per node in the overlay tree. Its
//! [`DeploymentStatus`] moves only along the edges returned by
//! [`DeploymentStatus::can_transition_to`]; the terminal "removed" state is
//! represented by the row no longer existing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Integer id of a node in the overlay tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(i32);

impl NodeId {
    /// Parent id of the root node, and the "no dependency" entry in `wait_for`.
    pub const NONE: NodeId = NodeId(-1);

    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(&self) -> i32 {
        self.0
    }

    /// Returns true for the `-1` sentinel.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == -1
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for NodeId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Stored deployment state of a lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Queued for provisioning until every `wait_for` node is deployed.
    WaitingDeployment,
    /// Eligible; waiting for the parent's agent to claim it.
    Deploying,
    /// Claimed by the parent's agent, provisioning in progress.
    ProcessingDeploying,
    /// Fully provisioned.
    Deployed,
    /// Provisioning failed; awaits an operator retry.
    Failed,
    /// Queued for teardown until every `wait_for` node is gone.
    WaitingRemoval,
    /// Eligible; waiting for the parent's agent to claim it.
    Removing,
    /// Claimed by the parent's agent, teardown in progress.
    ProcessingRemoving,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 8] = [
        Self::WaitingDeployment,
        Self::Deploying,
        Self::ProcessingDeploying,
        Self::Deployed,
        Self::Failed,
        Self::WaitingRemoval,
        Self::Removing,
        Self::ProcessingRemoving,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingDeployment => "WAITING_DEPLOYMENT",
            Self::Deploying => "DEPLOYING",
            Self::ProcessingDeploying => "PROCESSING_DEPLOYING",
            Self::Deployed => "DEPLOYED",
            Self::Failed => "FAILED",
            Self::WaitingRemoval => "WAITING_REMOVAL",
            Self::Removing => "REMOVING",
            Self::ProcessingRemoving => "PROCESSING_REMOVING",
        }
    }

    /// Whether a stored row may move from `self` to `next`.
    ///
    /// `Failed -> Deploying` (retry) and `Deployed -> WaitingRemoval`
    /// (removal request) are operator edges; the rest are written by the
    /// coordinator or an agent.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        matches!(
            (self, next),
            (WaitingDeployment, Deploying)
                | (Deploying, ProcessingDeploying)
                | (ProcessingDeploying, Deployed)
                | (ProcessingDeploying, Failed)
                | (Failed, Deploying)
                | (Deployed, WaitingRemoval)
                | (WaitingRemoval, Removing)
                | (Removing, ProcessingRemoving)
                | (ProcessingRemoving, Deployed)
        )
    }

    /// States an agent picks up and claims.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Deploying | Self::Removing)
    }

    /// States held while an agent is executing a command sequence.
    pub fn is_processing(&self) -> bool {
        matches!(self, Self::ProcessingDeploying | Self::ProcessingRemoving)
    }

    /// The processing state an agent claims a claimable row into.
    pub fn claimed(&self) -> Option<DeploymentStatus> {
        match self {
            Self::Deploying => Some(Self::ProcessingDeploying),
            Self::Removing => Some(Self::ProcessingRemoving),
            _ => None,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored status string that is not a known state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown deployment status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for DeploymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// One node's deployment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub node_id: NodeId,
    pub parent_id: NodeId,
    pub status: DeploymentStatus,
    /// Nodes that must be deployed (for provisioning) or gone (for removal)
    /// before this row may advance. `[-1]` means no dependency.
    pub wait_for: Vec<NodeId>,
    /// Server hosting the node.
    pub server_ref: Uuid,
}

impl LifecycleRecord {
    pub fn new(
        node_id: NodeId,
        parent_id: NodeId,
        status: DeploymentStatus,
        wait_for: Vec<NodeId>,
        server_ref: Uuid,
    ) -> Self {
        Self {
            node_id,
            parent_id,
            status,
            wait_for,
            server_ref,
        }
    }

    #[must_use]
    pub fn with_status(&self, status: DeploymentStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Structural checks that hold for every stored row.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.get() < 0 {
            return Err(format!("node id {} must not be negative", self.node_id));
        }
        if self.parent_id == self.node_id {
            return Err(format!("node {} cannot be its own parent", self.node_id));
        }
        if self.parent_id.get() < -1 {
            return Err(format!(
                "parent id {} of node {} is invalid",
                self.parent_id, self.node_id
            ));
        }
        if self.wait_for.contains(&self.node_id) {
            return Err(format!("node {} cannot wait for itself", self.node_id));
        }
        Ok(())
    }
}

/// How the agent authenticates against a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum ServerAuth {
    Password {
        password: String,
    },
    Identity {
        private_key_path: String,
        passphrase: Option<String>,
    },
}

impl ServerAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Identity { .. } => "identity",
        }
    }
}

/// Connection details of a machine that hosts (or will host) a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_uuid: Uuid,
    pub ip: String,
    pub username: String,
    pub auth: ServerAuth,
    pub ssh_port: u16,
    /// Port the overlay process listens on once deployed.
    pub control_port: u16,
    pub name: String,
}

/// Severity of a node log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Operator-visible log line tied to a node. Purged when the node is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLogRecord {
    pub node_id: NodeId,
    pub level: LogLevel,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_status_roundtrip() {
        for status in DeploymentStatus::ALL {
            let parsed: DeploymentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("REMOVED".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_stored_form() {
        let json = serde_json::to_string(&DeploymentStatus::ProcessingDeploying).unwrap();
        assert_eq!(json, "\"PROCESSING_DEPLOYING\"");
    }

    #[rstest]
    #[case(DeploymentStatus::WaitingDeployment, DeploymentStatus::Deploying, true)]
    #[case(DeploymentStatus::Deploying, DeploymentStatus::ProcessingDeploying, true)]
    #[case(DeploymentStatus::ProcessingDeploying, DeploymentStatus::Deployed, true)]
    #[case(DeploymentStatus::ProcessingDeploying, DeploymentStatus::Failed, true)]
    #[case(DeploymentStatus::Failed, DeploymentStatus::Deploying, true)]
    #[case(DeploymentStatus::WaitingRemoval, DeploymentStatus::Removing, true)]
    #[case(DeploymentStatus::Removing, DeploymentStatus::ProcessingRemoving, true)]
    #[case(DeploymentStatus::ProcessingRemoving, DeploymentStatus::Deployed, true)]
    #[case(DeploymentStatus::ProcessingRemoving, DeploymentStatus::Failed, false)]
    #[case(DeploymentStatus::WaitingDeployment, DeploymentStatus::Deployed, false)]
    #[case(DeploymentStatus::Deploying, DeploymentStatus::Deployed, false)]
    #[case(DeploymentStatus::Failed, DeploymentStatus::Deployed, false)]
    fn test_transition_edges(
        #[case] from: DeploymentStatus,
        #[case] to: DeploymentStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_claimed_state() {
        assert_eq!(
            DeploymentStatus::Deploying.claimed(),
            Some(DeploymentStatus::ProcessingDeploying)
        );
        assert_eq!(
            DeploymentStatus::Removing.claimed(),
            Some(DeploymentStatus::ProcessingRemoving)
        );
        assert_eq!(DeploymentStatus::Deployed.claimed(), None);
    }

    #[test]
    fn test_record_validation() {
        let server = Uuid::new_v4();
        let root = LifecycleRecord::new(
            NodeId::new(1),
            NodeId::NONE,
            DeploymentStatus::WaitingDeployment,
            vec![NodeId::NONE],
            server,
        );
        assert!(root.validate().is_ok());
        assert!(root.is_root());

        let own_parent = LifecycleRecord {
            parent_id: NodeId::new(1),
            ..root.clone()
        };
        assert!(own_parent.validate().is_err());

        let bad_parent = LifecycleRecord {
            parent_id: NodeId::new(-7),
            ..root
        };
        assert!(bad_parent.validate().is_err());
    }
}
