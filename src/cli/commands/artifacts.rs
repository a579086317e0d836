//! Artifact listing and release download commands

use anyhow::Result;

use super::load_services;
use crate::cli::args::Cli;
use crate::models::{ArtifactKind, DownloadReleaseRequest};

pub async fn execute_artifacts_command(cli: &Cli, firmware: Option<&str>) -> Result<()> {
    let services = load_services(cli)?;
    let files = services.artifacts.list(firmware);
    if files.is_empty() {
        println!("📦 No artifacts in {}", services.artifacts.artifacts_dir().display());
        return Ok(());
    }
    println!("📦 {} artifact(s):", files.len());
    for file in files {
        let icon = match file.kind {
            ArtifactKind::Artifact => "🔨",
            ArtifactKind::Backup => "💾",
            ArtifactKind::Release => "🏷️ ",
        };
        println!("  {} {:<60} {:>10} B  {}", icon, file.name, file.size, file.path);
    }
    Ok(())
}

pub async fn execute_download_release_command(
    cli: &Cli,
    owner: String,
    repo: String,
    tag: Option<String>,
    device_id: Option<String>,
    firmware_id: Option<String>,
    asset_filter: Option<String>,
) -> Result<()> {
    let services = load_services(cli)?;
    let request = DownloadReleaseRequest {
        owner,
        repo,
        tag,
        device_id,
        firmware_id,
        asset_filter,
    };
    let artifact = services.releases.download(&request).await?;
    println!("✅ Downloaded {} ({} bytes)", artifact.path, artifact.size);
    Ok(())
}
