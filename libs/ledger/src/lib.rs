//! # canopy-ledger
//!
//! The shared ledger of node lifecycle records for the canopy overlay.
//!
//! The coordinator and every agent coordinate exclusively through this
//! ledger: the coordinator moves queued rows to in-progress, agents claim
//! and finish them. Access goes through the [`Ledger`] trait so callers are
//! handed an explicit client ([`PgLedger`] in production, [`MemoryLedger`]
//! in tests) rather than reaching for process-wide state.

mod error;
mod memory;
mod postgres;
mod store;
mod types;

pub use error::{LedgerError, LedgerResult};
pub use memory::MemoryLedger;
pub use postgres::{DbConfig, PgLedger};
pub use store::Ledger;
pub use types::{
    DeploymentStatus, LifecycleRecord, LogLevel, NodeId, NodeLogRecord, ServerAuth, ServerRecord,
    UnknownStatus,
};

use std::sync::Arc;

/// Which ledger backend to construct.
#[derive(Debug, Clone)]
pub enum LedgerConfig {
    /// Process-local ledger; state is lost on exit.
    Memory,
    /// Postgres ledger.
    Postgres(DbConfig),
}

impl LedgerConfig {
    /// `CANOPY_LEDGER=memory` selects the in-memory ledger; anything else
    /// uses Postgres configured from `DATABASE_URL`.
    pub fn from_env() -> Self {
        match std::env::var("CANOPY_LEDGER").as_deref() {
            Ok("memory") => Self::Memory,
            _ => Self::Postgres(DbConfig::from_env()),
        }
    }

    /// Build the ledger handle. Runs migrations when `migrate` is set.
    pub async fn connect(&self, migrate: bool) -> LedgerResult<Arc<dyn Ledger>> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryLedger::new())),
            Self::Postgres(db) => {
                let ledger = PgLedger::connect(db).await?;
                if migrate {
                    ledger.run_migrations().await?;
                }
                Ok(Arc::new(ledger))
            }
        }
    }
}
