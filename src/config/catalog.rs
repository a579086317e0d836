//! Device catalog and build matrix, persisted in RON format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::{BuildTarget, DeviceProfile, FlashMethod, Toolchain};

/// Everything the orchestrator knows about device types and how to build for them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// Configuration version for compatibility
    pub config_version: u32,
    pub devices: Vec<DeviceProfile>,
    pub builds: Vec<BuildTarget>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    /// Devices and build targets shipped with labflash
    pub fn builtin() -> Self {
        let devices = vec![
            DeviceProfile {
                id: "t_beam_1w".to_string(),
                chip: "esp32s3".to_string(),
                flash_size: "8MB".to_string(),
                flash_mode: Some("dio".to_string()),
                description: "LilyGO T-Beam 1W (ESP32-S3)".to_string(),
                flash_method: FlashMethod::Serial,
            },
            DeviceProfile {
                id: "t_deck_plus".to_string(),
                chip: "esp32s3".to_string(),
                flash_size: "16MB".to_string(),
                flash_mode: Some("dio".to_string()),
                description: "LilyGO T-Deck Plus".to_string(),
                flash_method: FlashMethod::Serial,
            },
        ];

        let builds = vec![
            BuildTarget {
                device_id: "t_beam_1w".to_string(),
                firmware_id: "meshcore".to_string(),
                path: "devices/t_beam_1w/firmware/meshcore/repo".to_string(),
                envs: vec![
                    "T_Beam_1W_SX1262_repeater".to_string(),
                    "T_Beam_1W_SX1262_room_server".to_string(),
                    "T_Beam_1W_SX1262_companion_radio_ble".to_string(),
                ],
                build_subdir: None,
                toolchain: Toolchain::PlatformIo,
            },
            BuildTarget {
                device_id: "t_beam_1w".to_string(),
                firmware_id: "meshtastic".to_string(),
                path: "devices/t_beam_1w/firmware/meshtastic/repo".to_string(),
                envs: vec!["tbeam-1w".to_string()],
                build_subdir: None,
                toolchain: Toolchain::PlatformIo,
            },
        ];

        Self {
            config_version: 1,
            devices,
            builds,
        }
    }

    /// Load the catalog; a missing file yields the built-in catalog
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Catalog {} not found, using built-in device catalog",
                path.display()
            );
            return Ok(Self::builtin());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let catalog: Catalog = ron::from_str(&content)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
        log::debug!(
            "Loaded {} devices and {} build targets from {}",
            catalog.devices.len(),
            catalog.builds.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Save the catalog to a RON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .context("Failed to serialize catalog")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, ron_string)
            .with_context(|| format!("Failed to write catalog {}", path.display()))?;
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&DeviceProfile> {
        self.devices.iter().find(|d| d.id == id)
    }
}
