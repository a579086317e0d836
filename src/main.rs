//! labflash - lab firmware lifecycle orchestrator
//!
//! Binary entry point for the command line interface.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    labflash::cli::run().await
}
