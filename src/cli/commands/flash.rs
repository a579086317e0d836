//! Backup, restore and flash commands

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::load_services;
use crate::cli::args::{Cli, TransferArgs};
use crate::models::{BackupRequest, BackupScope, ImageSource, TransferRequest, parse_address};

pub async fn execute_backup_command(
    cli: &Cli,
    port: String,
    device: String,
    scope: BackupScope,
    name: Option<String>,
) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;

    // Ctrl+C stops the backup after the chunk in flight
    let cancel = Arc::new(AtomicBool::new(false));
    let signal_flag = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n⏹️  Cancelling backup...");
            signal_flag.store(true, Ordering::Relaxed);
        }
    });

    let request = BackupRequest {
        port,
        device_id: device,
        backup_type: scope,
        name,
    };
    let result = services.flasher.backup(&request, &snapshot, Some(cancel)).await;
    watcher.abort();

    let outcome = result?;
    println!(
        "✅ Backup saved: {} ({} bytes)",
        services.artifacts.relative(&outcome.path),
        outcome.size
    );
    Ok(())
}

pub async fn execute_restore_command(cli: &Cli, transfer: TransferArgs) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;
    let request = transfer_request(transfer, None).await?;
    let report = services.flasher.restore(request, &snapshot).await?;
    println!("✅ {}", report.message);
    Ok(())
}

pub async fn execute_flash_command(cli: &Cli, transfer: TransferArgs, addr: Option<&str>) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;
    let addr = addr.map(parse_address).transpose()?;
    let request = transfer_request(transfer, addr).await?;
    let report = services.flasher.flash(request, &snapshot).await?;
    println!("✅ {} ({} bytes at 0x{:X})", report.message, report.bytes, report.addr);
    Ok(())
}

/// A local `--file` becomes an upload, exactly as the server receives it
async fn transfer_request(args: TransferArgs, addr: Option<u32>) -> Result<TransferRequest> {
    let upload = match &args.file {
        Some(file) => {
            let bytes = tokio::fs::read(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Some((name, bytes))
        }
        None => None,
    };
    let source = ImageSource::resolve(upload, args.path)?;
    Ok(TransferRequest {
        port: args.port,
        device_id: args.device,
        source,
        addr,
    })
}
