// src/main.rs
//! `kb-picker`: browse a storage connection and index files into a knowledge base.
//!
//! - `kb-picker serve`: HTTP proxy in front of the Indexing Service
//! - `kb-picker browse`: interactive terminal browser
//!
//! Configuration comes from the environment (see `config.rs`);
//! `RUST_LOG` overrides the log filter.

mod client;
mod config;
mod kb;
mod logging;
mod model;
mod selection;
mod server;
mod session;
mod status;
mod terminal;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "kb-picker", version, about = "Pick files from a storage connection and index them")]
struct Cli {
    /// Debug-level logging (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP proxy.
    Serve,
    /// Browse and index interactively.
    Browse,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;
    let config = Config::from_env().context("invalid configuration")?;

    match cli.command {
        Command::Serve => server::run_server(&config).await,
        Command::Browse => terminal::run_browser(&config).await,
    }
}
