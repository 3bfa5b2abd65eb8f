//! Remote commands.
//!
//! A node is provisioned or torn down by running an ordered list of
//! [`RemoteCommand`]s. The agent only relies on `execute()` and the
//! `Display` description; everything else is up to the
//! [`SequenceBuilder`](crate::sequence::SequenceBuilder).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canopy_ledger::{Ledger, LedgerError, NodeId};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::{RemoteSession, TransportError};

/// Why a command failed.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("`{command}` exited with {actual:?}, expected {expected}: {stderr}")]
    UnexpectedExit {
        command: String,
        expected: i32,
        actual: Option<i32>,
        stderr: String,
    },

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{address} did not accept connections after {attempts} attempts")]
    NotReady { address: String, attempts: u32 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// One step of a provisioning or teardown sequence.
#[async_trait]
pub trait RemoteCommand: fmt::Display + Send + Sync {
    async fn execute(&self) -> Result<(), CommandError>;
}

/// Exit status a command must report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedExit {
    Code(i32),
    /// Cleanup steps that may legitimately fail (nothing to kill, no image).
    Any,
}

/// Run a shell command on the target.
pub struct Exec {
    session: Arc<dyn RemoteSession>,
    command: String,
    expected: ExpectedExit,
}

impl Exec {
    /// A command that must exit 0.
    pub fn new(session: Arc<dyn RemoteSession>, command: impl Into<String>) -> Self {
        Self {
            session,
            command: command.into(),
            expected: ExpectedExit::Code(0),
        }
    }

    /// A command whose exit status is ignored.
    pub fn allow_failure(session: Arc<dyn RemoteSession>, command: impl Into<String>) -> Self {
        Self {
            session,
            command: command.into(),
            expected: ExpectedExit::Any,
        }
    }
}

impl fmt::Display for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Executing {}", self.command)
    }
}

#[async_trait]
impl RemoteCommand for Exec {
    async fn execute(&self) -> Result<(), CommandError> {
        let output = self.session.exec(&self.command).await?;
        match self.expected {
            ExpectedExit::Code(code) if output.exit_status != Some(code) => {
                Err(CommandError::UnexpectedExit {
                    command: self.command.clone(),
                    expected: code,
                    actual: output.exit_status,
                    stderr: output.stderr.trim().to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Settings written to the node's properties file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProperties {
    pub node_id: NodeId,
    pub parent_id: NodeId,
    pub role: String,
    pub external_address: String,
    pub control_address: String,
    pub control_port: u16,
    pub parent_control_address: String,
    pub parent_control_port: u16,
    pub storage_address: String,
    pub storage_port: u16,
    pub parent_storage_address: String,
    pub parent_storage_port: u16,
}

impl NodeProperties {
    /// `key=value` lines, one per setting.
    pub fn render(&self) -> String {
        let entries: [(&str, String); 12] = [
            ("node_id", self.node_id.to_string()),
            ("parent_id", self.parent_id.to_string()),
            ("role", self.role.clone()),
            ("external_address", self.external_address.clone()),
            ("control_address", self.control_address.clone()),
            ("control_port", self.control_port.to_string()),
            ("parent_control_address", self.parent_control_address.clone()),
            ("parent_control_port", self.parent_control_port.to_string()),
            ("storage_address", self.storage_address.clone()),
            ("storage_port", self.storage_port.to_string()),
            ("parent_storage_address", self.parent_storage_address.clone()),
            ("parent_storage_port", self.parent_storage_port.to_string()),
        ];

        entries
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect()
    }
}

/// Write the node's properties file into the local staging directory.
pub struct GenerateConfig {
    properties: NodeProperties,
    destination: PathBuf,
}

impl GenerateConfig {
    pub fn new(properties: NodeProperties, destination: impl Into<PathBuf>) -> Self {
        Self {
            properties,
            destination: destination.into(),
        }
    }
}

impl fmt::Display for GenerateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Generating properties file for node {} at {}",
            self.properties.node_id,
            self.destination.display()
        )
    }
}

#[async_trait]
impl RemoteCommand for GenerateConfig {
    async fn execute(&self) -> Result<(), CommandError> {
        if let Some(dir) = self.destination.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| CommandError::Io {
                    action: "creating",
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&self.destination, self.properties.render())
            .await
            .map_err(|source| CommandError::Io {
                action: "writing",
                path: self.destination.clone(),
                source,
            })
    }
}

/// Copy a local file to the target.
pub struct FileTransfer {
    session: Arc<dyn RemoteSession>,
    local: PathBuf,
    remote: String,
}

impl FileTransfer {
    pub fn new(
        session: Arc<dyn RemoteSession>,
        local: impl Into<PathBuf>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            session,
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl fmt::Display for FileTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transferring {} to {}", self.local.display(), self.remote)
    }
}

#[async_trait]
impl RemoteCommand for FileTransfer {
    async fn execute(&self) -> Result<(), CommandError> {
        self.session.upload(&self.local, &self.remote).await?;
        Ok(())
    }
}

/// Delete a staged local file. A file that is already gone is fine.
pub struct RemoveLocalFile {
    path: PathBuf,
}

impl RemoveLocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for RemoveLocalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Removing local file {}", self.path.display())
    }
}

#[async_trait]
impl RemoteCommand for RemoveLocalFile {
    async fn execute(&self) -> Result<(), CommandError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CommandError::Io {
                action: "removing",
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Poll a TCP port until it accepts a connection.
pub struct WaitForPort {
    host: String,
    port: u16,
    attempts: u32,
    interval: Duration,
}

impl WaitForPort {
    pub fn new(host: impl Into<String>, port: u16, attempts: u32, interval: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            attempts: attempts.max(1),
            interval,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for WaitForPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Waiting for {} to accept connections", self.address())
    }
}

#[async_trait]
impl RemoteCommand for WaitForPort {
    async fn execute(&self) -> Result<(), CommandError> {
        let address = self.address();
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.interval, TcpStream::connect(&address)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => debug!(address = %address, attempt, error = %e, "Port not ready"),
                Err(_) => debug!(address = %address, attempt, "Port connect timed out"),
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(CommandError::NotReady {
            address,
            attempts: self.attempts,
        })
    }
}

/// Delete the node's lifecycle record. Final step of a successful teardown.
pub struct DeleteLedgerRecord {
    ledger: Arc<dyn Ledger>,
    node_id: NodeId,
}

impl DeleteLedgerRecord {
    pub fn new(ledger: Arc<dyn Ledger>, node_id: NodeId) -> Self {
        Self { ledger, node_id }
    }
}

impl fmt::Display for DeleteLedgerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deleting ledger record of node {}", self.node_id)
    }
}

#[async_trait]
impl RemoteCommand for DeleteLedgerRecord {
    async fn execute(&self) -> Result<(), CommandError> {
        self.ledger.delete_record(self.node_id).await?;
        Ok(())
    }
}

/// Drop auxiliary ledger state (log lines) tied to the node.
pub struct PurgeNodeState {
    ledger: Arc<dyn Ledger>,
    node_id: NodeId,
}

impl PurgeNodeState {
    pub fn new(ledger: Arc<dyn Ledger>, node_id: NodeId) -> Self {
        Self { ledger, node_id }
    }
}

impl fmt::Display for PurgeNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Purging ledger state of node {}", self.node_id)
    }
}

#[async_trait]
impl RemoteCommand for PurgeNodeState {
    async fn execute(&self) -> Result<(), CommandError> {
        let purged = self.ledger.purge_node_state(self.node_id).await?;
        debug!(node_id = %self.node_id, purged, "Purged node state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::transport::Connector;
    use canopy_ledger::{ServerAuth, ServerRecord};
    use tokio::net::TcpListener;

    async fn mock_session(connector: &MockConnector) -> Arc<dyn RemoteSession> {
        let server = ServerRecord {
            server_uuid: uuid::Uuid::new_v4(),
            ip: "10.0.0.2".to_string(),
            username: "canopy".to_string(),
            auth: ServerAuth::Identity {
                private_key_path: "/keys/id".to_string(),
                passphrase: None,
            },
            ssh_port: 22,
            control_port: 1099,
            name: "edge-2".to_string(),
        };
        connector.connect(&server).await.unwrap()
    }

    fn properties() -> NodeProperties {
        NodeProperties {
            node_id: NodeId::new(2),
            parent_id: NodeId::new(1),
            role: "SERVER".to_string(),
            external_address: "10.0.0.2".to_string(),
            control_address: "127.0.0.1".to_string(),
            control_port: 1099,
            parent_control_address: "10.0.0.1".to_string(),
            parent_control_port: 1100,
            storage_address: "127.0.0.1".to_string(),
            storage_port: 9052,
            parent_storage_address: "10.0.0.1".to_string(),
            parent_storage_port: 9052,
        }
    }

    #[tokio::test]
    async fn test_exec_checks_exit_status() {
        let connector = MockConnector::new();
        connector.fail_on("docker ps");
        let session = mock_session(&connector).await;

        let err = Exec::new(session.clone(), "docker ps")
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::UnexpectedExit {
                expected: 0,
                actual: Some(1),
                ..
            }
        ));

        Exec::allow_failure(session, "docker ps -a")
            .execute()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exec_on_closed_session_fails() {
        let connector = MockConnector::new();
        let session = mock_session(&connector).await;
        session.close().await.unwrap();

        let err = Exec::allow_failure(session, "true")
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_generate_then_remove_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-2").join("canopy.properties");

        GenerateConfig::new(properties(), &path)
            .execute()
            .await
            .unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("node_id=2\n"));
        assert!(contents.contains("parent_control_address=10.0.0.1\n"));

        let remove = RemoveLocalFile::new(&path);
        remove.execute().await.unwrap();
        assert!(!remove.path().exists());
        // Second removal is a no-op.
        remove.execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_port_succeeds_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        WaitForPort::new("127.0.0.1", port, 3, Duration::from_millis(50))
            .execute()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_port_gives_up() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = WaitForPort::new("127.0.0.1", port, 2, Duration::from_millis(20))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotReady { attempts: 2, .. }));
    }

    #[test]
    fn test_descriptions() {
        let wait = WaitForPort::new("10.0.0.2", 9052, 1, Duration::from_secs(1));
        assert_eq!(wait.to_string(), "Waiting for 10.0.0.2:9052 to accept connections");
    }
}
