//! Serial port enumeration, chip probing and device suggestions

use serialport::SerialPortType;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::build_matrix::BuildMatrixSnapshot;
use super::port_lock::PortLocks;
use super::tool_runner::{RunContext, ToolCommand, ToolFailure, ToolRunner, run_with_fallback};
use crate::models::{DeviceProfile, Port, PortDiagnostic, PortListing, Selection};
use crate::utils::esptool_utils::{clean_message, parse_chip};

/// Virtual/debug ports that never carry a device
const EXCLUDED_PORT_MARKERS: &[&str] = &["debug-console", "bluetooth-incoming", "tty.debug", "cu.debug"];

/// `/dev` entries scanned when the platform enumeration returns nothing
const DEV_FALLBACK_PATTERNS: &[&str] = &[
    "/dev/cu.usbmodem*",
    "/dev/cu.usbserial*",
    "/dev/tty.usbmodem*",
    "/dev/tty.usbserial*",
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
];

/// Chip hints tried after auto-detection fails
const PROBE_CHIP_HINTS: &[&str] = &["esp32s3", "esp32"];

/// Where serial ports come from
pub trait PortSource: Send + Sync {
    /// Cheap enumeration without touching the devices
    fn enumerate(&self) -> Result<Vec<Port>, String>;
}

/// Ports reported by the operating system, with a `/dev` scan fallback
#[derive(Debug, Clone, Default)]
pub struct SystemPortSource;

impl PortSource for SystemPortSource {
    fn enumerate(&self) -> Result<Vec<Port>, String> {
        let mut seen = HashSet::new();
        let mut ports = Vec::new();

        match serialport::available_ports() {
            Ok(available) => {
                for info in available {
                    let description = match &info.port_type {
                        SerialPortType::UsbPort(usb) => usb
                            .product
                            .clone()
                            .or_else(|| usb.manufacturer.clone())
                            .unwrap_or_else(|| info.port_name.clone()),
                        _ => info.port_name.clone(),
                    };
                    if is_excluded_port(&info.port_name, &description) {
                        continue;
                    }
                    if seen.insert(info.port_name.clone()) {
                        ports.push(Port::new(info.port_name, description));
                    }
                }
            }
            Err(e) => {
                log::warn!("Serial port enumeration failed: {}", e);
                let fallback = scan_dev_fallback();
                if fallback.is_empty() {
                    return Err(e.to_string());
                }
                return Ok(fallback);
            }
        }

        if ports.is_empty() {
            ports = scan_dev_fallback();
        }
        Ok(ports)
    }
}

/// Scan `/dev` for common USB serial device names
fn scan_dev_fallback() -> Vec<Port> {
    let mut found = Vec::new();
    for pattern in DEV_FALLBACK_PATTERNS {
        let Ok(paths) = glob::glob(pattern) else {
            continue;
        };
        for path in paths.flatten() {
            let name = path.to_string_lossy().to_string();
            if !is_excluded_port(&name, "") && !found.iter().any(|p: &Port| p.port == name) {
                found.push(Port::new(name.clone(), name));
            }
        }
    }
    found.sort_by(|a, b| a.port.cmp(&b.port));
    found
}

pub fn is_excluded_port(port: &str, description: &str) -> bool {
    let combined = format!("{} {}", port, description).to_ascii_lowercase();
    EXCLUDED_PORT_MARKERS.iter().any(|marker| combined.contains(marker))
}

/// The other name of the same macOS USB serial device (`cu.*` <-> `tty.*`)
pub fn alternate_port(port: &str) -> Option<String> {
    let path = Path::new(port);
    if !path.is_absolute() {
        return None;
    }
    let base = path.file_name()?.to_string_lossy().to_string();
    let lower = base.to_ascii_lowercase();
    if !(lower.contains("usbmodem") || lower.contains("usbserial")) {
        return None;
    }
    let renamed = if let Some(rest) = base.strip_prefix("cu.") {
        format!("tty.{}", rest)
    } else if let Some(rest) = base.strip_prefix("tty.") {
        format!("cu.{}", rest)
    } else {
        return None;
    };
    Some(path.with_file_name(renamed).to_string_lossy().to_string())
}

/// Enumerates ports and suggests catalog devices for them
pub struct PortRegistry {
    source: Arc<dyn PortSource>,
    runner: Arc<dyn ToolRunner>,
    locks: PortLocks,
    esptool: Vec<String>,
    probe_timeout: Duration,
    in_container: bool,
}

impl PortRegistry {
    pub fn new(
        source: Arc<dyn PortSource>,
        runner: Arc<dyn ToolRunner>,
        locks: PortLocks,
        esptool: Vec<String>,
        probe_timeout: Duration,
        in_container: bool,
    ) -> Self {
        Self {
            source,
            runner,
            locks,
            esptool,
            probe_timeout,
            in_container,
        }
    }

    /// List ports; with `detect`, probe each one for its chip and suggest
    /// matching devices. Never fails: problems become a diagnostic.
    pub async fn list_ports(&self, detect: bool, snapshot: &BuildMatrixSnapshot) -> PortListing {
        let ports = match self.source.enumerate() {
            Ok(ports) => ports,
            Err(e) => {
                let diagnostic = if self.in_container {
                    PortDiagnostic::ContainerNoUsb
                } else {
                    PortDiagnostic::EnumerationFailed(e)
                };
                return PortListing {
                    ports: Vec::new(),
                    diagnostic: Some(diagnostic),
                };
            }
        };

        if ports.is_empty() {
            let diagnostic = if self.in_container {
                log::info!("📦 No serial ports visible inside container (no USB passthrough?)");
                Some(PortDiagnostic::ContainerNoUsb)
            } else if detect {
                Some(PortDiagnostic::NoPorts)
            } else {
                None
            };
            return PortListing {
                ports,
                diagnostic,
            };
        }

        if !detect {
            return PortListing {
                ports,
                diagnostic: None,
            };
        }

        let mut detected = Vec::with_capacity(ports.len());
        for mut port in ports {
            // Probing opens the port; skip ones owned by a running transfer
            let probe = match self.locks.acquire(&port.port) {
                Ok(_lease) => self.probe_chip(&port.port).await,
                Err(_) => (None, Some("Port busy".to_string())),
            };
            match probe {
                (Some(chip), _) => {
                    log::info!("🔌 {} -> {}", port.port, chip);
                    port.suggested_device_ids = suggestions_for_chip(&chip, snapshot.devices());
                    port.chip = Some(chip);
                }
                (None, error) => {
                    log::debug!("No chip detected on {}: {:?}", port.port, error);
                    port.detection_error = error;
                }
            }
            detected.push(port);
        }

        PortListing {
            ports: detected,
            diagnostic: None,
        }
    }

    pub fn list_devices(&self, snapshot: &BuildMatrixSnapshot) -> Vec<DeviceProfile> {
        snapshot.devices().to_vec()
    }

    /// Identify the chip on `port`: auto-detect first, then explicit hints.
    /// Returns the chip or the most useful error text.
    pub async fn probe_chip(&self, port: &str) -> (Option<String>, Option<String>) {
        let ctx = RunContext::default();
        let mut last_error = None;

        let hints = std::iter::once(None).chain(PROBE_CHIP_HINTS.iter().map(|c| Some(*c)));
        for (attempt, hint) in hints.enumerate() {
            let mut command = ToolCommand::new("esptool").args(["--port", port]);
            if let Some(chip) = hint {
                command = command.args(["--chip", chip]);
            }
            command = command.arg("read-mac");

            match run_with_fallback(self.runner.as_ref(), &self.esptool, &command, self.probe_timeout, &ctx).await {
                Ok(out) => {
                    if let Some(chip) = parse_chip(&out.output) {
                        return (Some(chip), None);
                    }
                    if attempt == 0 && !out.success && !out.output.trim().is_empty() {
                        last_error = Some(clean_message(&out.output).chars().take(200).collect());
                    }
                }
                Err(ToolFailure::TimedOut(_)) => continue,
                Err(ToolFailure::NotFound(_)) => return (None, Some("esptool not found".to_string())),
                Err(other) => return (None, Some(other.to_string())),
            }
        }

        (None, Some(last_error.unwrap_or_else(|| "Could not detect chip".to_string())))
    }
}

/// Catalog devices built around `chip`, in catalog order
pub fn suggestions_for_chip(chip: &str, devices: &[DeviceProfile]) -> Vec<String> {
    devices
        .iter()
        .filter(|d| d.chip.eq_ignore_ascii_case(chip))
        .map(|d| d.id.clone())
        .collect()
}

/// First-match auto detection: the first port (enumeration order) with
/// suggestions wins and its first suggestion is chosen. Other ports with
/// suggestions are surfaced as candidates.
pub fn auto_select(listing: &PortListing) -> Selection {
    let mut with_suggestions = listing
        .ports
        .iter()
        .filter(|p| !p.suggested_device_ids.is_empty());

    let Some(first) = with_suggestions.next() else {
        return Selection::Nothing;
    };
    let port = first.port.clone();
    let device_id = first.suggested_device_ids[0].clone();
    let others: Vec<String> = with_suggestions.map(|p| p.port.clone()).collect();

    if others.is_empty() {
        Selection::Detected { port, device_id }
    } else {
        let mut candidates = vec![port.clone()];
        candidates.extend(others);
        log::warn!(
            "⚠️ Multiple ports report known devices ({}); choosing {}",
            candidates.join(", "),
            port
        );
        Selection::Ambiguous {
            port,
            device_id,
            candidates,
        }
    }
}
