//! Port, device, target and patch listing commands

use anyhow::Result;

use super::load_services;
use crate::cli::args::Cli;
use crate::models::{PortDiagnostic, Selection};
use crate::services::build_matrix::{patches_for, targets_for_device};
use crate::services::port_registry::auto_select;

pub async fn execute_ports_command(cli: &Cli, detect: bool) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;
    if detect {
        println!("🔍 Probing serial ports for chips...");
    }
    let listing = services.registry.list_ports(detect, &snapshot).await;

    match &listing.diagnostic {
        Some(PortDiagnostic::ContainerNoUsb) => {
            println!("📦 No serial ports visible: running in a container without USB passthrough.");
            println!("   Pass the device through (e.g. --device /dev/ttyACM0) or run labflash on the host.");
        }
        Some(PortDiagnostic::NoPorts) => println!("⚠️  No serial ports found. Is a device connected?"),
        Some(PortDiagnostic::EnumerationFailed(reason)) => {
            println!("❌ Serial port enumeration failed: {}", reason)
        }
        None if listing.ports.is_empty() => println!("⚠️  No serial ports found."),
        None => {}
    }

    for port in &listing.ports {
        let chip = match (&port.chip, &port.detection_error) {
            (Some(chip), _) => chip.clone(),
            (None, Some(err)) => format!("not detected: {}", err),
            (None, None) => "-".to_string(),
        };
        println!("🔌 {:<24} {:<32} {}", port.port, port.description, chip);
        if !port.suggested_device_ids.is_empty() {
            println!("   ↳ suggested: {}", port.suggested_device_ids.join(", "));
        }
    }

    if detect {
        match auto_select(&listing) {
            Selection::Detected { port, device_id } => {
                println!("🎯 Auto-selected {} on {}", device_id, port)
            }
            Selection::Ambiguous {
                port,
                device_id,
                candidates,
            } => println!(
                "🎯 Auto-selected {} on {} (also matching: {})",
                device_id,
                port,
                candidates.join(", ")
            ),
            Selection::Nothing => {}
        }
    }
    Ok(())
}

pub async fn execute_devices_command(cli: &Cli) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;
    let devices = services.registry.list_devices(&snapshot);
    if devices.is_empty() {
        println!("⚠️  No devices in catalog {}", services.catalog_path().display());
        return Ok(());
    }
    println!("📟 {} device(s):", devices.len());
    for device in devices {
        println!(
            "  - {:<16} {:<10} {:<5} {}",
            device.id, device.chip, device.flash_size, device.description
        );
    }
    Ok(())
}

pub async fn execute_targets_command(cli: &Cli, device: Option<&str>) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;
    let targets = match device {
        Some(device) => targets_for_device(&snapshot, device),
        None => snapshot.targets().to_vec(),
    };
    if targets.is_empty() {
        println!("⚠️  No build targets{}", device.map(|d| format!(" for {}", d)).unwrap_or_default());
        return Ok(());
    }
    for target in targets {
        println!(
            "🎯 {}/{} ({:?}) at {}",
            target.device_id, target.firmware_id, target.toolchain, target.path
        );
        for env in &target.envs {
            println!("   - {}", env);
        }
    }
    Ok(())
}

pub async fn execute_patches_command(cli: &Cli, device: &str, firmware: &str) -> Result<()> {
    let services = load_services(cli)?;
    let snapshot = services.snapshot().await;
    let patches = patches_for(&snapshot, services.repo_root(), Some(device), Some(firmware));
    if patches.is_empty() {
        println!("ℹ️  No patches for {}/{}", device, firmware);
    }
    for patch in patches {
        println!("🩹 {:<40} {}", patch.name, patch.path);
    }
    Ok(())
}
