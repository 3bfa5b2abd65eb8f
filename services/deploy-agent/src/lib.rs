//! canopy deploy agent library.
//!
//! One agent runs on every node that hosts children. It claims the child
//! rows the coordinator has released and drives each one through a remote
//! command sequence over SSH:
//!
//! - **Agent**: polls the ledger, claims rows, bounds concurrency
//! - **Executor**: runs one sequence and records the outcome
//! - **Sequence builder**: decides which commands bring a node up or down
//! - **Transport**: remote sessions (system ssh or an in-process client in
//!   production, mock in tests)

pub mod agent;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod mock;
pub mod sequence;
pub mod transport;

pub use agent::{Agent, AgentSettings, PollStats};
pub use config::AgentConfig;
pub use error::AgentError;
pub use executor::{ExecutionOutcome, Executor, LocalNode};
pub use mock::MockConnector;
pub use sequence::{ContainerSequenceBuilder, InstallLayout, SequenceBuilder, SequenceRequest};
pub use transport::{
    Connector, DirectConnector, HostKeyPolicy, OpenSshConnector, RemoteSession, SshConnector,
};
