//! canopy coordinator library.
//!
//! The coordinator is the single fleet-wide loop of the deployment control
//! plane. Each cycle it reads every lifecycle record and moves rows whose
//! dependencies are satisfied from queued to in-progress:
//!
//! - `WAITING_DEPLOYMENT -> DEPLOYING` once every `wait_for` node is deployed
//! - `WAITING_REMOVAL -> REMOVING` once every `wait_for` node is gone
//!
//! It never touches in-progress or terminal rows; those belong to the agent
//! running on the row's parent.

pub mod config;
pub mod coordinator;
pub mod worker;

pub use coordinator::{Coordinator, CycleStats};
pub use worker::CoordinatorWorker;
