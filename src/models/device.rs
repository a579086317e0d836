//! Device catalog and build matrix models

use serde::{Deserialize, Serialize};

/// How firmware reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashMethod {
    #[default]
    Serial,
    /// Drag-and-drop mass storage; serial transfers are refused
    Uf2,
}

/// A known device type from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    /// esptool chip id, e.g. "esp32s3"
    pub chip: String,
    /// "4MB", "8MB" or "16MB"
    pub flash_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_mode: Option<String>,
    pub description: String,
    #[serde(default)]
    pub flash_method: FlashMethod,
}

impl DeviceProfile {
    /// Flash capacity in bytes; unknown sizes are treated as 8MB
    pub fn flash_bytes(&self) -> u64 {
        const MB: u64 = 1024 * 1024;
        match self.flash_size.to_ascii_uppercase().as_str() {
            "4MB" => 4 * MB,
            "16MB" => 16 * MB,
            _ => 8 * MB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    #[default]
    #[serde(rename = "platformio")]
    PlatformIo,
    Idf,
}

/// One (device, firmware) entry of the build matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    pub device_id: String,
    pub firmware_id: String,
    /// Firmware source path relative to the repo root
    pub path: String,
    pub envs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_subdir: Option<String>,
    #[serde(default)]
    pub toolchain: Toolchain,
}

/// A selectable source patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Relative to the firmware source root, e.g. "patches/001-radio.patch"
    pub path: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_bytes_defaults_to_8mb() {
        let mut profile = DeviceProfile {
            id: "t_beam_1w".to_string(),
            chip: "esp32s3".to_string(),
            flash_size: "16MB".to_string(),
            flash_mode: Some("dio".to_string()),
            description: "LilyGO T-Beam 1W".to_string(),
            flash_method: FlashMethod::Serial,
        };
        assert_eq!(profile.flash_bytes(), 16 * 1024 * 1024);
        profile.flash_size = "32MB".to_string();
        assert_eq!(profile.flash_bytes(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_toolchain_wire_names() {
        assert_eq!(
            serde_json::to_string(&Toolchain::PlatformIo).unwrap(),
            "\"platformio\""
        );
        assert_eq!(serde_json::to_string(&Toolchain::Idf).unwrap(), "\"idf\"");
    }
}
