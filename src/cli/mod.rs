//! Command Line Interface module
//!
//! Argument parsing and the command implementations of the `labflash`
//! binary. Local commands run the orchestration services in-process;
//! `remote-build` talks to a labflash server.

pub mod args;
pub mod commands;

pub use args::*;

use anyhow::Result;

use crate::utils::logging::init_cli_logging;

/// Main CLI application runner
pub async fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_cli_logging(cli.verbose, cli.quiet)?;
    commands::execute_command(cli.command.clone(), &cli).await
}
