//! labflash server - HTTP surface for the firmware orchestrator
//!
//! Binary entry point for the server application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labflash::config::{DEFAULT_CONFIG_FILE, LabConfig};
use labflash::server::start_server;
use labflash::utils::logging::init_server_logging;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Parser)]
#[command(name = "labflash-server")]
#[command(about = "labflash firmware orchestration server")]
#[command(version)]
struct ServerCli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Lab repository root (overrides the config file and LABFLASH_REPO_ROOT)
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<ServerCommands>,
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Start the server
    Start,
    /// Generate default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ServerCli::parse();

    match cli.command {
        Some(ServerCommands::Config) => {
            println!("⚙️  Generating default configuration...");
            generate_config(&cli.config).await
        }
        Some(ServerCommands::Start) | None => {
            let mut config = LabConfig::load(&cli.config)?;
            if let Some(bind) = cli.bind {
                config.server.bind_address = bind;
            }
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(root) = cli.repo_root {
                config.repo_root = root;
            }
            if cli.json_logs {
                config.server.structured_logs = true;
            }

            let log_file = config.server.log_file.as_ref().map(|p| p.to_string_lossy().to_string());
            init_server_logging(
                config.server.structured_logs,
                log_file.as_deref(),
                config.server.log_level.parse().ok(),
            )?;
            println!("🧪 Starting labflash server...");
            start_server(config).await
        }
    }
}

/// Generate a default server configuration file
async fn generate_config(config_path: &Path) -> Result<()> {
    let toml_content = LabConfig::default().to_toml()?;

    fs::write(config_path, toml_content)
        .await
        .with_context(|| format!("Failed to write config file '{}'", config_path.display()))?;

    println!(
        "✅ Generated default configuration file: {}",
        config_path.display()
    );
    println!("ℹ️  You can edit this file to customize server settings.");
    println!(
        "ℹ️  Use --config {} to load this configuration.",
        config_path.display()
    );
    Ok(())
}
