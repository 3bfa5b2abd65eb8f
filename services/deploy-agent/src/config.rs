//! Configuration for the deploy agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use canopy_ledger::{LedgerConfig, NodeId};

use crate::agent::AgentSettings;
use crate::executor::LocalNode;
use crate::sequence::InstallLayout;
use crate::transport::{HostKeyPolicy, DEFAULT_CONNECT_TIMEOUT};

/// Default pause between ledger polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default cap on simultaneous executions (and SSH sessions).
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 8;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node this agent runs on. Rows whose parent is this node are ours.
    pub node_id: NodeId,

    /// Address children use to reach this node.
    pub external_address: String,

    /// Port of this node's overlay process.
    pub control_port: u16,

    /// Storage port, the same on every node.
    pub storage_port: u16,

    pub poll_interval: Duration,

    pub max_concurrent_executions: usize,

    /// Install directory on target hosts.
    pub install_dir: String,

    /// Local directory for generated properties files.
    pub staging_dir: PathBuf,

    /// Local directory with the deploy key and Dockerfiles.
    pub docker_files_dir: PathBuf,

    /// Source branch the images are built from.
    pub branch: String,

    /// How many times to check a freshly started service.
    pub readiness_attempts: u32,

    pub readiness_interval: Duration,

    /// Timeout for opening an SSH session.
    pub connect_timeout: Duration,

    /// Host key handling for every SSH client.
    pub host_keys: HostKeyPolicy,

    pub ledger: LedgerConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_id: NodeId = std::env::var("CANOPY_NODE_ID")
            .context("CANOPY_NODE_ID must be set")?
            .parse()
            .context("CANOPY_NODE_ID must be an integer")?;

        let external_address = std::env::var("CANOPY_EXTERNAL_ADDRESS")
            .unwrap_or_else(|_| "127.0.0.1".to_string());

        Ok(Self {
            node_id,
            external_address,
            control_port: env_parse("CANOPY_CONTROL_PORT", 1099)?,
            storage_port: env_parse("CANOPY_STORAGE_PORT", 9052)?,
            poll_interval: env_millis("CANOPY_AGENT_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL)?,
            max_concurrent_executions: env_parse(
                "CANOPY_MAX_CONCURRENT_EXECUTIONS",
                DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            )?
            .max(1),
            install_dir: std::env::var("CANOPY_INSTALL_DIR")
                .unwrap_or_else(|_| "canopy-install".to_string()),
            staging_dir: std::env::var("CANOPY_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("canopy-staging")),
            docker_files_dir: std::env::var("CANOPY_DOCKER_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("docker-files")),
            branch: std::env::var("CANOPY_BRANCH").unwrap_or_else(|_| "main".to_string()),
            readiness_attempts: env_parse("CANOPY_READINESS_ATTEMPTS", 60)?,
            readiness_interval: env_millis(
                "CANOPY_READINESS_INTERVAL_MS",
                Duration::from_secs(5),
            )?,
            connect_timeout: env_millis("CANOPY_SSH_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT)?,
            host_keys: match std::env::var("CANOPY_SSH_ACCEPT_UNKNOWN_HOSTS") {
                Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => HostKeyPolicy::AcceptAll,
                _ => HostKeyPolicy::AddUnknown,
            },
            ledger: LedgerConfig::from_env(),
            log_level: std::env::var("CANOPY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            node_id: self.node_id,
            poll_interval: self.poll_interval,
            max_concurrent_executions: self.max_concurrent_executions,
        }
    }

    pub fn local_node(&self) -> LocalNode {
        LocalNode {
            node_id: self.node_id,
            address: self.external_address.clone(),
            control_port: self.control_port,
            storage_port: self.storage_port,
        }
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout {
            install_dir: self.install_dir.clone(),
            staging_dir: self.staging_dir.clone(),
            docker_files_dir: self.docker_files_dir.clone(),
            branch: self.branch.clone(),
            readiness_attempts: self.readiness_attempts,
            readiness_interval: self.readiness_interval,
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid value for {key}: {value}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_parse::<u64>(key, default.as_millis() as u64).map(Duration::from_millis)
}
