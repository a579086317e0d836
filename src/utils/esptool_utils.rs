//! Helpers around esptool invocations and ESP flash images

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::errors::LabError;
use crate::models::{APP_OFFSET, DeviceProfile};
use crate::services::tool_runner::ToolFailure;

static CHIP_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)Chip (?:is|type:)\s*(ESP32[^\s(]*)").ok());

static ANSI_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok());

static UNSAFE_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^\w\-.]").ok());

static UNDERSCORE_RUN_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"_+").ok());

/// Messages esptool prints when another process holds the port
const BUSY_MARKERS: &[&str] = &[
    "port is busy",
    "resource temporarily unavailable",
    "could not exclusively lock",
    "device or resource busy",
];

/// Longest error text surfaced to callers
const MAX_ERROR_LEN: usize = 500;

/// ESP image header magic byte
const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// Offset of the chip id (u16 LE) inside the extended image header
const CHIP_ID_OFFSET: usize = 12;

/// Extract a normalised chip id from esptool output,
/// e.g. "Chip is ESP32-S3 (QFN56) (revision v0.2)" -> "esp32s3"
pub fn parse_chip(output: &str) -> Option<String> {
    let re = CHIP_RE.as_ref()?;
    let raw = re.captures(output)?.get(1)?.as_str();
    Some(normalize_chip(raw))
}

/// Map an esptool chip label onto the `--chip` value used for flashing
pub fn normalize_chip(raw: &str) -> String {
    let chip = raw.trim().to_ascii_lowercase().replace('-', "");
    if chip.starts_with("esp32s3") {
        "esp32s3".to_string()
    } else if chip.starts_with("esp32s2") {
        "esp32s2".to_string()
    } else if chip.starts_with("esp32c3") || chip.starts_with("esp32c6") {
        "esp32c3".to_string()
    } else if chip.starts_with("esp32") {
        "esp32".to_string()
    } else {
        chip
    }
}

pub fn strip_ansi(text: &str) -> String {
    match ANSI_RE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Strip ANSI codes, trim and bound the length of tool output
pub fn clean_message(text: &str) -> String {
    let cleaned = strip_ansi(text);
    let trimmed = cleaned.trim();
    if trimmed.chars().count() <= MAX_ERROR_LEN {
        return trimmed.to_string();
    }
    // Keep the tail: esptool prints the actual error last
    let skip = trimmed.chars().count() - MAX_ERROR_LEN;
    trimmed.chars().skip(skip).collect()
}

pub fn is_port_busy(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    BUSY_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Classify failed esptool output: busy markers mean another owner holds
/// the port, anything else is a transfer failure
pub fn classify_failure(output: &str, port: &str) -> LabError {
    if is_port_busy(output) {
        return LabError::PortBusy {
            port: port.to_string(),
        };
    }
    let message = clean_message(output);
    if message.is_empty() {
        LabError::Transfer(format!("esptool failed on {}", port))
    } else {
        LabError::Transfer(message)
    }
}

/// Map a tool that never completed onto the error taxonomy
pub fn classify_tool_failure(failure: ToolFailure, port: &str) -> LabError {
    match failure {
        ToolFailure::NotFound(_) => {
            LabError::Execution("esptool not found (pip install esptool)".to_string())
        }
        ToolFailure::TimedOut(limit) => LabError::Transfer(format!(
            "Timeout after {}s talking to {}",
            limit.as_secs(),
            port
        )),
        ToolFailure::Cancelled => LabError::Cancelled,
        ToolFailure::Io(msg) => LabError::Transfer(msg),
    }
}

/// Make a safe backup file name: word characters, dash and dot only,
/// always ending in `.bin`. Returns `None` when nothing usable remains.
pub fn sanitize_backup_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (unsafe_re, run_re) = (UNSAFE_NAME_RE.as_ref()?, UNDERSCORE_RUN_RE.as_ref()?);
    let replaced = unsafe_re.replace_all(trimmed, "_");
    let collapsed = run_re.replace_all(&replaced, "_");
    let stripped = collapsed.trim_matches(|c| c == '_' || c == '.');
    if stripped.is_empty() {
        return None;
    }
    if stripped.to_ascii_lowercase().ends_with(".bin") {
        Some(stripped.to_string())
    } else {
        Some(format!("{}.bin", stripped))
    }
}

/// Chip id stored in ESP image headers for a given `--chip` value
pub fn image_chip_id(chip: &str) -> Option<u16> {
    match chip {
        "esp32" => Some(0),
        "esp32s2" => Some(2),
        "esp32c3" => Some(5),
        "esp32s3" => Some(9),
        "esp32c2" => Some(12),
        "esp32c6" => Some(13),
        "esp32h2" => Some(16),
        _ => None,
    }
}

/// Chip id from the header of an ESP application or merged image, if the
/// data starts with one
pub fn read_image_chip_id(header: &[u8]) -> Option<u16> {
    if header.len() < CHIP_ID_OFFSET + 2 || header[0] != ESP_IMAGE_MAGIC {
        return None;
    }
    Some(u16::from_le_bytes([
        header[CHIP_ID_OFFSET],
        header[CHIP_ID_OFFSET + 1],
    ]))
}

/// Reject images that cannot belong on this device. Non-ESP images (raw
/// backups of erased flash, NVS dumps) only get the size check.
pub fn check_image(header: &[u8], image_len: u64, addr: u32, device: &DeviceProfile) -> Result<(), LabError> {
    let capacity = device.flash_bytes();
    if u64::from(addr) + image_len > capacity {
        return Err(LabError::DeviceMismatch(format!(
            "Image of {} bytes at 0x{:X} exceeds {} flash of {}",
            image_len, addr, device.flash_size, device.id
        )));
    }
    if let (Some(found), Some(expected)) = (read_image_chip_id(header), image_chip_id(&device.chip)) {
        // C6 images are accepted on profiles flashed as esp32c3
        let c6_on_c3 = device.chip == "esp32c3" && found == 13;
        if found != expected && !c6_on_c3 {
            return Err(LabError::DeviceMismatch(format!(
                "Image was built for chip id {} but {} is {}",
                found, device.id, device.chip
            )));
        }
    }
    Ok(())
}

/// Default write address for an image: full images (merged, factory,
/// backups) start at 0x0, an app-only `firmware.bin` under artifacts goes to
/// the app partition.
pub fn infer_flash_address(path: &str) -> u32 {
    let normalized = path.replace('\\', "/");
    let file_name = Path::new(&normalized)
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if file_name.contains("factory") || file_name.contains("merged") || file_name.starts_with("backup_") {
        return 0;
    }
    let under_artifacts = normalized.starts_with("artifacts/") || normalized.contains("/artifacts/");
    if file_name == "firmware.bin" && under_artifacts && !normalized.contains("/backups/") {
        return APP_OFFSET;
    }
    0
}
