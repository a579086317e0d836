//! CLI command implementations

pub mod artifacts;
pub mod build;
pub mod flash;
pub mod ports;
pub mod remote_build;

use anyhow::{Context, Result};

use crate::cli::args::{Cli, Commands};
use crate::config::LabConfig;
use crate::services::LabServices;

/// Execute a CLI command
pub async fn execute_command(command: Commands, cli: &Cli) -> Result<()> {
    match command {
        Commands::Ports { detect } => ports::execute_ports_command(cli, detect).await,
        Commands::Devices => ports::execute_devices_command(cli).await,
        Commands::Targets { device } => ports::execute_targets_command(cli, device.as_deref()).await,
        Commands::Patches { device, firmware } => {
            ports::execute_patches_command(cli, &device, &firmware).await
        }
        Commands::Build(args) => build::execute_build_command(cli, &args).await,
        Commands::Backup {
            port,
            device,
            scope,
            name,
        } => flash::execute_backup_command(cli, port, device, scope, name).await,
        Commands::Restore(transfer) => flash::execute_restore_command(cli, transfer).await,
        Commands::Flash { transfer, addr } => {
            flash::execute_flash_command(cli, transfer, addr.as_deref()).await
        }
        Commands::Artifacts { firmware } => {
            artifacts::execute_artifacts_command(cli, firmware.as_deref()).await
        }
        Commands::DownloadRelease {
            owner,
            repo,
            tag,
            device,
            firmware,
            asset_filter,
        } => {
            artifacts::execute_download_release_command(
                cli,
                owner,
                repo,
                tag,
                device,
                firmware,
                asset_filter,
            )
            .await
        }
        Commands::RemoteBuild { server, build } => {
            remote_build::execute_remote_build_command(&server, &build).await
        }
    }
}

/// Configuration for local commands: the config file, then
/// LABFLASH_REPO_ROOT, then `--repo-root`
pub fn load_config(cli: &Cli) -> Result<LabConfig> {
    let mut config = LabConfig::load(&cli.config)?;
    if let Some(root) = &cli.repo_root {
        config.repo_root = root.clone();
    }
    log::debug!("Using repository root {}", config.repo_root.display());
    Ok(config)
}

pub fn load_services(cli: &Cli) -> Result<LabServices> {
    let config = load_config(cli)?;
    if !config.repo_root.is_dir() {
        return Err(anyhow::anyhow!(
            "Repository root does not exist: {}",
            config.repo_root.display()
        ));
    }
    LabServices::from_config(config).context("Failed to initialise services")
}
