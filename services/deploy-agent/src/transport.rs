//! Remote shell transport.
//!
//! The agent opens one session per execution through a [`Connector`], runs
//! every command of the sequence over it, and closes it on every exit path.
//! Production uses [`SshConnector`], which hands identity-file servers to
//! the system `ssh` through [`OpenSshConnector`] and everything needing a
//! secret (passwords, passphrase-protected keys) to [`DirectConnector`].
//! Tests use [`MockConnector`](crate::mock::MockConnector).

mod direct;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canopy_ledger::{ServerAuth, ServerRecord};
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

pub use direct::DirectConnector;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("{kind} authentication is not supported for {target}")]
    UnsupportedAuth { target: String, kind: &'static str },

    #[error("failed to run `{command}`: {reason}")]
    Exec { command: String, reason: String },

    #[error("failed to upload {local} to {remote}: {reason}")]
    Upload {
        local: String,
        remote: String,
        reason: String,
    },

    #[error("failed to close session to {target}: {reason}")]
    Close { target: String, reason: String },

    #[error("session already closed")]
    Closed,
}

/// Result of a remote shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` if the remote process was killed by a signal.
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// An open, authenticated session on a target host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError>;

    /// Copy a local file to `remote`, relative to the login directory.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Release the session. Calling it twice is harmless.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens sessions against server records.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn RemoteSession>, TransportError>;
}

/// What to do with a host key that is not in `known_hosts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Trust it on first use and record it. A changed key is rejected.
    #[default]
    AddUnknown,
    /// Accept any host key. Only for disposable lab fleets.
    AcceptAll,
}

/// Default timeout for opening a session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Picks a client for each server by its authentication material.
#[derive(Debug, Clone)]
pub struct SshConnector {
    mux: OpenSshConnector,
    direct: DirectConnector,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, host_keys: HostKeyPolicy) -> Self {
        Self {
            mux: OpenSshConnector::new(connect_timeout, host_keys),
            direct: DirectConnector::new(connect_timeout, host_keys),
        }
    }
}

/// The system `ssh` can only use key files it can open without a prompt.
pub fn uses_system_ssh(auth: &ServerAuth) -> bool {
    matches!(
        auth,
        ServerAuth::Identity {
            passphrase: None,
            ..
        }
    )
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn RemoteSession>, TransportError> {
        if uses_system_ssh(&server.auth) {
            self.mux.connect(server).await
        } else {
            self.direct.connect(server).await
        }
    }
}

fn target_of(server: &ServerRecord) -> String {
    format!("{}@{}:{}", server.username, server.ip, server.ssh_port)
}

/// Connector backed by the system `ssh` binary through a multiplexed master.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    connect_timeout: Duration,
    known_hosts: KnownHosts,
}

impl OpenSshConnector {
    pub fn new(connect_timeout: Duration, host_keys: HostKeyPolicy) -> Self {
        let known_hosts = match host_keys {
            HostKeyPolicy::AddUnknown => KnownHosts::Add,
            HostKeyPolicy::AcceptAll => KnownHosts::Accept,
        };
        Self {
            connect_timeout,
            known_hosts,
        }
    }
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, HostKeyPolicy::default())
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let target = target_of(server);

        // ssh cannot take a password non-interactively.
        let keyfile = match &server.auth {
            ServerAuth::Identity {
                private_key_path, ..
            } => private_key_path.clone(),
            ServerAuth::Password { .. } => {
                return Err(TransportError::UnsupportedAuth {
                    target,
                    kind: server.auth.kind(),
                })
            }
        };

        let mut builder = SessionBuilder::default();
        builder
            .user(server.username.clone())
            .port(server.ssh_port)
            .keyfile(&keyfile)
            .known_hosts_check(self.known_hosts.clone())
            .connect_timeout(self.connect_timeout);

        let session = builder
            .connect_mux(&server.ip)
            .await
            .map_err(|e| TransportError::Connect {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        debug!(target = %target, "SSH session opened");
        Ok(Arc::new(OpenSshSession {
            target,
            session: RwLock::new(Some(session)),
        }))
    }
}

struct OpenSshSession {
    target: String,
    session: RwLock<Option<Session>>,
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(TransportError::Closed)?;

        let output = session
            .shell(command)
            .output()
            .await
            .map_err(|e| TransportError::Exec {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        Ok(ExecOutput {
            exit_status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let upload_err = |reason: String| TransportError::Upload {
            local: local.display().to_string(),
            remote: remote.to_string(),
            reason,
        };

        let contents = tokio::fs::read(local)
            .await
            .map_err(|e| upload_err(e.to_string()))?;

        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(TransportError::Closed)?;

        let mut command = session.shell(format!("cat > {}", shell_quote(remote)));
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = command
            .spawn()
            .await
            .map_err(|e| upload_err(e.to_string()))?;

        let mut stdin = child
            .stdin()
            .take()
            .ok_or_else(|| upload_err("remote stdin unavailable".to_string()))?;
        stdin
            .write_all(&contents)
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        drop(stdin);

        let status = child.wait().await.map_err(|e| upload_err(e.to_string()))?;
        if !status.success() {
            return Err(upload_err(format!("remote write exited with {status}")));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.close().await.map_err(|e| TransportError::Close {
                target: self.target.clone(),
                reason: e.to_string(),
            })?;
            debug!(target = %self.target, "SSH session closed");
        }
        Ok(())
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
