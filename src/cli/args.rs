//! Command line argument parsing

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;
use crate::models::{BackupScope, BuildRequest};
use crate::remote::DEFAULT_SERVER_URL;

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(name = "labflash")]
#[command(about = "🧪 Lab firmware orchestrator: discover ports, build, flash, back up and restore devices")]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Lab repository root (overrides the config file and LABFLASH_REPO_ROOT)
    #[arg(long, global = true, value_name = "DIR")]
    pub repo_root: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Decrease logging verbosity (only errors)
    #[arg(short = 'q', long = "quiet", global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// List serial ports
    Ports {
        /// Probe each port for its chip and suggest matching devices
        #[arg(short, long)]
        detect: bool,
    },
    /// List device profiles from the catalog
    Devices,
    /// List build targets (device x firmware) and their envs
    Targets {
        /// Only targets of this device
        #[arg(short, long)]
        device: Option<String>,
    },
    /// List patches available for a device/firmware pair
    Patches {
        #[arg(short, long)]
        device: String,
        #[arg(short, long)]
        firmware: String,
    },
    /// Build firmware locally, optionally flashing the result
    Build(BuildArgs),
    /// Read flash contents into artifacts/backups
    Backup {
        #[arg(short, long)]
        port: String,
        #[arg(short, long)]
        device: String,
        /// full, app or nvs
        #[arg(short = 't', long = "type", default_value = "full")]
        scope: BackupScope,
        /// Custom file name (sanitised, .bin appended)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Write a full image at 0x0
    Restore(TransferArgs),
    /// Write an image at an explicit or inferred address
    Flash {
        #[command(flatten)]
        transfer: TransferArgs,
        /// Flash address (decimal or 0x-prefixed hex)
        #[arg(short, long)]
        addr: Option<String>,
    },
    /// List build outputs, releases and backups
    Artifacts {
        /// Only artifacts of this firmware (unknown ids are ignored)
        #[arg(short, long)]
        firmware: Option<String>,
    },
    /// Download a .bin asset from a GitHub release
    DownloadRelease {
        owner: String,
        repo: String,
        /// Release tag (latest when omitted)
        #[arg(short, long)]
        tag: Option<String>,
        #[arg(short, long)]
        device: Option<String>,
        #[arg(short, long)]
        firmware: Option<String>,
        /// Case-insensitive substring the asset name must contain
        #[arg(short, long)]
        asset_filter: Option<String>,
    },
    /// Build on a labflash server, streaming its log
    RemoteBuild {
        /// labflash server URL
        #[arg(short, long, default_value = DEFAULT_SERVER_URL)]
        server: String,
        #[command(flatten)]
        build: BuildArgs,
    },
}

#[derive(Args, Clone, Debug)]
pub struct BuildArgs {
    #[arg(short, long)]
    pub device: String,
    #[arg(short, long)]
    pub firmware: String,
    /// Build env (PlatformIO env name; "default" for IDF targets)
    #[arg(short, long)]
    pub env: String,
    /// Patch to apply, relative to the firmware root (repeatable)
    #[arg(short, long = "patch")]
    pub patches: Vec<String>,
    /// Clean before building
    #[arg(long)]
    pub clean: bool,
    /// Verbose build tool output
    #[arg(long)]
    pub verbose_build: bool,
    /// Build timeout in seconds (60-3600, default 300)
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Flash the artifact to this port after a successful build
    #[arg(long, requires = "flash_device")]
    pub flash_port: Option<String>,
    /// Device profile to flash with
    #[arg(long, requires = "flash_port")]
    pub flash_device: Option<String>,
}

impl BuildArgs {
    pub fn to_request(&self) -> BuildRequest {
        let request = BuildRequest {
            device_id: self.device.clone(),
            firmware_id: self.firmware.clone(),
            env_name: self.env.clone(),
            patch_paths: self.patches.clone(),
            clean: self.clean,
            verbose: self.verbose_build,
            timeout: self.timeout,
            ..Default::default()
        };
        match (&self.flash_port, &self.flash_device) {
            (Some(port), Some(device)) => request.with_flash(port.clone(), device.clone()),
            _ => request,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct TransferArgs {
    #[arg(short, long)]
    pub port: String,
    #[arg(short, long)]
    pub device: String,
    /// Artifact path relative to the repo root
    #[arg(long, conflicts_with = "file")]
    pub path: Option<String>,
    /// Local image file to upload
    #[arg(long)]
    pub file: Option<PathBuf>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_args_to_request() {
        let cli = Cli::try_parse_from([
            "labflash",
            "build",
            "-d",
            "t_beam_1w",
            "-f",
            "meshtastic",
            "-e",
            "tbeam-1w",
            "--patch",
            "patches/001-radio.patch",
            "--flash-port",
            "/dev/ttyACM0",
            "--flash-device",
            "t_beam_1w",
        ])
        .unwrap();
        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        let request = args.to_request();
        assert!(request.flash_after);
        assert_eq!(request.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(request.patch_paths, vec!["patches/001-radio.patch"]);
    }

    #[test]
    fn test_flash_port_requires_device() {
        let parsed = Cli::try_parse_from([
            "labflash",
            "build",
            "-d",
            "t_beam_1w",
            "-f",
            "meshtastic",
            "-e",
            "tbeam-1w",
            "--flash-port",
            "/dev/ttyACM0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_backup_scope_parses() {
        let cli = Cli::try_parse_from(["labflash", "backup", "-p", "/dev/ttyACM0", "-d", "t_beam_1w", "-t", "nvs"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Backup {
                scope: BackupScope::Nvs,
                ..
            }
        ));
    }
}
