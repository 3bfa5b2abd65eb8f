//! Configuration for the coordinator.

use std::time::Duration;

use anyhow::Result;
use canopy_ledger::LedgerConfig;

/// Default pause between coordinator cycles.
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(5);

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pause between cycles.
    pub cycle_interval: Duration,

    /// Ledger backend.
    pub ledger: LedgerConfig,

    /// Run ledger migrations on startup.
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cycle_interval = match std::env::var("CANOPY_COORDINATOR_INTERVAL_MS") {
            Ok(ms) => Duration::from_millis(ms.parse()?),
            Err(_) => DEFAULT_CYCLE_INTERVAL,
        };

        let dev_mode = std::env::var("CANOPY_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_level = std::env::var("CANOPY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            cycle_interval,
            ledger: LedgerConfig::from_env(),
            dev_mode,
            log_level,
        })
    }
}
