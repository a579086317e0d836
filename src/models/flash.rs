//! Flash, backup and restore models

use serde::{Deserialize, Serialize};

use super::device::DeviceProfile;
use crate::errors::{LabError, Result};

pub const APP_OFFSET: u32 = 0x10000;
pub const APP_REGION_SIZE: u64 = 0x180000;
pub const NVS_OFFSET: u32 = 0x9000;
pub const NVS_REGION_SIZE: u64 = 0x6000;

/// Which region of device flash a backup reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupScope {
    #[default]
    Full,
    App,
    Nvs,
}

impl BackupScope {
    /// (start address, byte length) of the region on this device
    pub fn region(&self, device: &DeviceProfile) -> (u32, u64) {
        match self {
            BackupScope::Full => (0, device.flash_bytes()),
            BackupScope::App => (APP_OFFSET, APP_REGION_SIZE),
            BackupScope::Nvs => (NVS_OFFSET, NVS_REGION_SIZE),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupScope::Full => "full",
            BackupScope::App => "app",
            BackupScope::Nvs => "nvs",
        }
    }
}

impl std::str::FromStr for BackupScope {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupScope::Full),
            "app" => Ok(BackupScope::App),
            "nvs" => Ok(BackupScope::Nvs),
            other => Err(LabError::Validation(format!(
                "Unknown backup_type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub backup_type: BackupScope,
    /// Optional custom file name, sanitised before use
    #[serde(default)]
    pub name: Option<String>,
}

/// A finished backup, already moved to its final location
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub path: std::path::PathBuf,
    pub file_name: String,
    pub size: u64,
}

/// The binary image for a restore or flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Upload { file_name: String, bytes: Vec<u8> },
    /// Path into the artifact store, relative to the repo root
    ArtifactPath(String),
}

impl ImageSource {
    /// Pick exactly one source; both or neither is rejected before any I/O
    pub fn resolve(upload: Option<(String, Vec<u8>)>, path: Option<String>) -> Result<Self> {
        let upload = upload.filter(|(name, _)| !name.trim().is_empty());
        let path = path
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        match (upload, path) {
            (Some(_), Some(_)) => Err(LabError::Validation(
                "Provide either an uploaded file or an artifact path, not both".to_string(),
            )),
            (None, None) => Err(LabError::Validation(
                "No image: upload a .bin file or select an artifact path".to_string(),
            )),
            (Some((file_name, bytes)), None) => {
                if !file_name.to_ascii_lowercase().ends_with(".bin") {
                    return Err(LabError::Validation(format!(
                        "Uploaded file must be a .bin image: {}",
                        file_name
                    )));
                }
                Ok(ImageSource::Upload { file_name, bytes })
            }
            (None, Some(path)) => Ok(ImageSource::ArtifactPath(path)),
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            ImageSource::Upload { file_name, .. } => file_name,
            ImageSource::ArtifactPath(path) => path,
        }
    }
}

/// Restore or flash submission
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub port: String,
    pub device_id: String,
    pub source: ImageSource,
    /// Explicit write address; inferred from the source when absent
    pub addr: Option<u32>,
}

/// Parse "0x10000" or "65536"
pub fn parse_address(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse::<u32>(),
    };
    parsed.map_err(|_| LabError::Validation(format!("Invalid flash address: {}", raw)))
}

/// Successful restore or flash
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub message: String,
    pub addr: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupPhase {
    #[default]
    Idle,
    Reading,
    Assembling,
    Done,
    Error,
    Cancelled,
}

/// Poll-able snapshot of the running chunked backup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    pub pct: u8,
    pub chunk: u32,
    pub total_chunks: u32,
    pub status: BackupPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
