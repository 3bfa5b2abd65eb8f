//! In-process SSH client for servers that authenticate with a secret.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canopy_ledger::{ServerAuth, ServerRecord};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
    shell_quote, target_of, Connector, ExecOutput, HostKeyPolicy, RemoteSession, TransportError,
    DEFAULT_CONNECT_TIMEOUT,
};

/// Connector that speaks SSH itself, so password and passphrase-key
/// servers need no ssh-agent or prompt.
#[derive(Debug, Clone)]
pub struct DirectConnector {
    connect_timeout: Duration,
    host_keys: HostKeyPolicy,
}

impl DirectConnector {
    pub fn new(connect_timeout: Duration, host_keys: HostKeyPolicy) -> Self {
        Self {
            connect_timeout,
            host_keys,
        }
    }
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, HostKeyPolicy::default())
    }
}

struct HostKeyCheck {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAll {
            return Ok(true);
        }

        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                if let Err(e) = russh_keys::learn_known_hosts(&self.host, self.port, server_public_key)
                {
                    warn!(host = %self.host, error = %e, "Failed to record host key");
                }
                Ok(true)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Host key verification failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let target = target_of(server);
        let connect_err = |reason: String| TransportError::Connect {
            target: target.clone(),
            reason,
        };

        let handler = HostKeyCheck {
            host: server.ip.clone(),
            port: server.ssh_port,
            policy: self.host_keys,
        };
        let config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (server.ip.as_str(), server.ssh_port), handler),
        )
        .await
        .map_err(|_| connect_err(format!("timed out after {:?}", self.connect_timeout)))?
        .map_err(|e| connect_err(e.to_string()))?;

        let authenticated = match &server.auth {
            ServerAuth::Password { password } => {
                handle
                    .authenticate_password(server.username.clone(), password.clone())
                    .await
            }
            ServerAuth::Identity {
                private_key_path,
                passphrase,
            } => {
                let key = russh_keys::load_secret_key(private_key_path, passphrase.as_deref())
                    .map_err(|e| connect_err(format!("failed to load {private_key_path}: {e}")))?;
                handle
                    .authenticate_publickey(server.username.clone(), Arc::new(key))
                    .await
            }
        }
        .map_err(|e| connect_err(e.to_string()))?;

        if !authenticated {
            return Err(connect_err(format!(
                "{} authentication rejected",
                server.auth.kind()
            )));
        }

        debug!(target = %target, auth = server.auth.kind(), "SSH session opened");
        Ok(Arc::new(DirectSession {
            target,
            handle: RwLock::new(Some(handle)),
        }))
    }
}

struct DirectSession {
    target: String,
    handle: RwLock<Option<Handle<HostKeyCheck>>>,
}

/// Run `command` on a fresh channel, feeding it `input` if given.
async fn run(
    handle: &Handle<HostKeyCheck>,
    command: &str,
    input: Option<&[u8]>,
) -> Result<ExecOutput, russh::Error> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;
    if let Some(input) = input {
        channel.data(input).await?;
        channel.eof().await?;
    }

    let mut exit_status = None;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data, .. } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1, .. } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status: code, .. } => {
                exit_status = i32::try_from(code).ok();
            }
            _ => {}
        }
    }

    Ok(ExecOutput {
        exit_status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

#[async_trait]
impl RemoteSession for DirectSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;

        run(handle, command, None)
            .await
            .map_err(|e| TransportError::Exec {
                command: command.to_string(),
                reason: e.to_string(),
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

        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;

        let output = run(
            handle,
            &format!("cat > {}", shell_quote(remote)),
            Some(contents.as_slice()),
        )
        .await
        .map_err(|e| upload_err(e.to_string()))?;

        match output.exit_status {
            Some(0) => Ok(()),
            status => Err(upload_err(format!("remote write exited with {status:?}"))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| TransportError::Close {
                    target: self.target.clone(),
                    reason: e.to_string(),
                })?;
            debug!(target = %self.target, "SSH session closed");
        }
        Ok(())
    }
}
