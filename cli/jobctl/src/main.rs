//! jobctl - CLI for the jobplane control plane
//!
//! Manages firewall rules and machines. Every change is applied by an
//! asynchronous job; `--wait` follows the job until it completes.

use anyhow::Result;
use clap::Parser;

mod client;
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
