//! Build command implementation

use anyhow::Result;
use tokio::sync::mpsc;

use super::load_services;
use crate::cli::args::{BuildArgs, Cli};
use crate::models::{BuildOutcome, FlashFollowUp};

pub async fn execute_build_command(cli: &Cli, args: &BuildArgs) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;
    let request = args.to_request();

    log::info!("🔨 labflash build");
    log::info!("📁 Repository: {}", services.repo_root().display());
    println!(
        "🔨 Building {}/{} (env {}){}",
        request.device_id,
        request.firmware_id,
        request.env_name,
        if request.patch_paths.is_empty() {
            String::new()
        } else {
            format!(" with {} patch(es)", request.patch_paths.len())
        }
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let quiet = cli.quiet;
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if !quiet {
                println!("   {}", line.trim_end());
            }
        }
    });

    let outcome = services.builds.submit(&request, &snapshot, Some(tx)).await;
    let _ = printer.await;

    match outcome? {
        BuildOutcome::Succeeded { artifact, flash } => {
            println!("✅ Build succeeded: {}", artifact.path);
            match flash {
                FlashFollowUp::NotRequested => {}
                FlashFollowUp::Flashed { message } => println!("⚡ {}", message),
                FlashFollowUp::Failed { error } => {
                    println!("⚠️  Build artifact kept, but flashing failed: {}", error)
                }
            }
            Ok(())
        }
        BuildOutcome::Failed { error } => Err(anyhow::anyhow!("Build failed: {}", error)),
        BuildOutcome::TimedOut { seconds } => {
            Err(anyhow::anyhow!("Build timed out after {}s", seconds))
        }
    }
}
