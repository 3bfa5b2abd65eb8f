//! CLI commands.

mod logs;
mod remove;
mod retry;
mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use canopy_ledger::{DbConfig, Ledger, PgLedger};
use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

/// canopy operator CLI - inspect and steer node deployments.
#[derive(Debug, Parser)]
#[command(name = "canopyctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Ledger database URL.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show every lifecycle record.
    Status(status::StatusCommand),

    /// Show a node's log lines.
    Logs(logs::LogsCommand),

    /// Move a FAILED node back to DEPLOYING.
    Retry(retry::RetryCommand),

    /// Request removal of a DEPLOYED node.
    Remove(remove::RemoveCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            format: self.format,
            database_url: self.database_url,
        };

        match self.command {
            Commands::Status(cmd) => cmd.run(ctx).await,
            Commands::Logs(cmd) => cmd.run(ctx).await,
            Commands::Retry(cmd) => cmd.run(ctx).await,
            Commands::Remove(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("canopyctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub database_url: Option<String>,
}

impl CommandContext {
    /// Connect to the ledger database.
    pub async fn ledger(&self) -> Result<Arc<dyn Ledger>> {
        let database_url = self
            .database_url
            .clone()
            .context("DATABASE_URL is not set; pass --database-url")?;

        let config = DbConfig {
            database_url,
            max_connections: 2,
            min_connections: 0,
            ..DbConfig::default()
        };
        let ledger = PgLedger::connect(&config)
            .await
            .map_err(crate::error::CliError::from)?;
        Ok(Arc::new(ledger))
    }
}
