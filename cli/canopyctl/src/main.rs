//! canopyctl - operator CLI for the canopy deployment ledger
//!
//! Inspects lifecycle records and node logs, retries failed deployments
//! and requests removals. Talks to the ledger database directly.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
