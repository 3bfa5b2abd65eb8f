//! Command sequence builder.
//!
//! Turns "node N under parent P must come up (or go away)" into the ordered
//! list of commands that does it on a container host. Nothing here runs
//! anything; the [`Executor`](crate::executor::Executor) does.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use canopy_ledger::{Ledger, NodeId};

use crate::commands::{
    DeleteLedgerRecord, Exec, FileTransfer, GenerateConfig, NodeProperties, PurgeNodeState,
    RemoteCommand, RemoveLocalFile, WaitForPort,
};
use crate::transport::{shell_quote, RemoteSession};

const STORAGE_NAME: &str = "canopy-storage";
const OVERLAY_NAME: &str = "canopy-overlay";
const PROPERTIES_FILE: &str = "canopy.properties";

/// Whether the sequence brings a node up or tears it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Deploy,
    Remove,
}

/// Position of a node in the tree, as written to its properties file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    RootServer,
    Server,
}

impl Role {
    pub fn for_parent(parent_id: NodeId) -> Self {
        if parent_id.is_none() {
            Self::RootServer
        } else {
            Self::Server
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootServer => f.write_str("ROOTSERVER"),
            Self::Server => f.write_str("SERVER"),
        }
    }
}

/// Everything a builder needs to know about the node and its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRequest {
    pub node_id: NodeId,
    pub parent_id: NodeId,
    pub role: Role,
    pub mode: Mode,
    /// Address of the target host.
    pub address: String,
    pub control_port: u16,
    pub storage_port: u16,
    pub parent_address: String,
    pub parent_control_port: u16,
    pub parent_storage_port: u16,
}

/// Produces the ordered command list for a request.
pub trait SequenceBuilder: Send + Sync {
    fn build(
        &self,
        request: &SequenceRequest,
        session: Arc<dyn RemoteSession>,
    ) -> Vec<Box<dyn RemoteCommand>>;
}

/// Where things live locally and on the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    /// Install directory on the target, relative to the login directory.
    pub install_dir: String,
    /// Local directory for generated properties files.
    pub staging_dir: PathBuf,
    /// Local directory holding `deploy_key`, `storage/Dockerfile` and
    /// `overlay/Dockerfile`.
    pub docker_files_dir: PathBuf,
    /// Source branch passed to the image builds.
    pub branch: String,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
}

/// Builds container-based deploy and teardown sequences.
pub struct ContainerSequenceBuilder {
    layout: InstallLayout,
    ledger: Arc<dyn Ledger>,
}

impl ContainerSequenceBuilder {
    pub fn new(layout: InstallLayout, ledger: Arc<dyn Ledger>) -> Self {
        Self { layout, ledger }
    }

    fn remote(&self, path: &str) -> String {
        format!("{}/{}", self.layout.install_dir, path)
    }

    fn build_image(&self, session: &Arc<dyn RemoteSession>, name: &str) -> Box<dyn RemoteCommand> {
        Box::new(Exec::new(
            Arc::clone(session),
            format!(
                "docker build -t {name} --build-arg key=\"$(cat {key})\" --build-arg branch={branch} {context}",
                key = self.remote("deploy_key"),
                branch = shell_quote(&self.layout.branch),
                context = self.remote(name),
            ),
        ))
    }

    fn run_container(session: &Arc<dyn RemoteSession>, name: &str) -> Box<dyn RemoteCommand> {
        Box::new(Exec::new(
            Arc::clone(session),
            format!("docker run --network=host -dit --rm --name {name} {name}"),
        ))
    }

    fn wait_for(&self, host: &str, port: u16) -> Box<dyn RemoteCommand> {
        Box::new(WaitForPort::new(
            host,
            port,
            self.layout.readiness_attempts,
            self.layout.readiness_interval,
        ))
    }

    fn deploy(
        &self,
        request: &SequenceRequest,
        session: Arc<dyn RemoteSession>,
    ) -> Vec<Box<dyn RemoteCommand>> {
        let staged = self
            .layout
            .staging_dir
            .join(format!("node-{}.{}", request.node_id, PROPERTIES_FILE));
        let properties = NodeProperties {
            node_id: request.node_id,
            parent_id: request.parent_id,
            role: request.role.to_string(),
            external_address: request.address.clone(),
            control_address: "127.0.0.1".to_string(),
            control_port: request.control_port,
            parent_control_address: request.parent_address.clone(),
            parent_control_port: request.parent_control_port,
            storage_address: "127.0.0.1".to_string(),
            storage_port: request.storage_port,
            parent_storage_address: request.parent_address.clone(),
            parent_storage_port: request.parent_storage_port,
        };
        let install = &self.layout.install_dir;
        let docker_files = &self.layout.docker_files_dir;
        let s = &session;

        let mut commands: Vec<Box<dyn RemoteCommand>> = Vec::with_capacity(21);
        commands.push(Box::new(Exec::new(Arc::clone(s), "docker ps")));
        for name in [STORAGE_NAME, OVERLAY_NAME] {
            commands.push(Box::new(Exec::allow_failure(
                Arc::clone(s),
                format!("docker kill {name}"),
            )));
            commands.push(Box::new(Exec::allow_failure(
                Arc::clone(s),
                format!("docker image rm {name}"),
            )));
        }
        commands.push(Box::new(Exec::allow_failure(
            Arc::clone(s),
            format!("rm -rf {install}"),
        )));
        commands.push(Box::new(Exec::new(
            Arc::clone(s),
            format!("mkdir -p {install}"),
        )));
        for name in [STORAGE_NAME, OVERLAY_NAME] {
            commands.push(Box::new(Exec::new(
                Arc::clone(s),
                format!("mkdir -p {}", self.remote(name)),
            )));
        }

        commands.push(Box::new(GenerateConfig::new(properties, &staged)));
        commands.push(Box::new(FileTransfer::new(
            Arc::clone(s),
            &staged,
            self.remote(&format!("{OVERLAY_NAME}/{PROPERTIES_FILE}")),
        )));
        commands.push(Box::new(RemoveLocalFile::new(&staged)));
        commands.push(Box::new(FileTransfer::new(
            Arc::clone(s),
            docker_files.join("deploy_key"),
            self.remote("deploy_key"),
        )));
        for (dir, name) in [("storage", STORAGE_NAME), ("overlay", OVERLAY_NAME)] {
            commands.push(Box::new(FileTransfer::new(
                Arc::clone(s),
                docker_files.join(dir).join("Dockerfile"),
                self.remote(&format!("{name}/Dockerfile")),
            )));
        }

        commands.push(self.build_image(s, STORAGE_NAME));
        commands.push(Self::run_container(s, STORAGE_NAME));
        commands.push(self.wait_for(&request.address, request.storage_port));
        commands.push(self.build_image(s, OVERLAY_NAME));
        commands.push(Self::run_container(s, OVERLAY_NAME));
        commands.push(self.wait_for(&request.address, request.control_port));
        commands
    }

    fn remove(
        &self,
        request: &SequenceRequest,
        session: Arc<dyn RemoteSession>,
    ) -> Vec<Box<dyn RemoteCommand>> {
        let s = &session;
        let mut commands: Vec<Box<dyn RemoteCommand>> = Vec::with_capacity(7);
        // A rolled-back removal may already have stopped the containers.
        for name in [OVERLAY_NAME, STORAGE_NAME] {
            commands.push(Box::new(Exec::allow_failure(
                Arc::clone(s),
                format!("docker kill {name}"),
            )));
        }
        for name in [OVERLAY_NAME, STORAGE_NAME] {
            commands.push(Box::new(Exec::allow_failure(
                Arc::clone(s),
                format!("docker image rm {name}"),
            )));
        }
        commands.push(Box::new(Exec::new(
            Arc::clone(s),
            format!("rm -rf {}", self.layout.install_dir),
        )));
        commands.push(Box::new(DeleteLedgerRecord::new(
            Arc::clone(&self.ledger),
            request.node_id,
        )));
        commands.push(Box::new(PurgeNodeState::new(
            Arc::clone(&self.ledger),
            request.node_id,
        )));
        commands
    }
}

impl SequenceBuilder for ContainerSequenceBuilder {
    fn build(
        &self,
        request: &SequenceRequest,
        session: Arc<dyn RemoteSession>,
    ) -> Vec<Box<dyn RemoteCommand>> {
        match request.mode {
            Mode::Deploy => self.deploy(request, session),
            Mode::Remove => self.remove(request, session),
        }
    }
}
