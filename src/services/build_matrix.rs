//! Build matrix resolution over an explicit, caller-owned snapshot

use anyhow::Result;
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::patches::list_patches;
use crate::config::Catalog;
use crate::models::{BuildTarget, DeviceProfile, Patch, Toolchain};

/// Placeholder env for IDF targets, which build without a named env
pub const IDF_DEFAULT_ENV: &str = "default";

/// Immutable view of the device catalog and build matrix at one point in time
#[derive(Debug, Clone)]
pub struct BuildMatrixSnapshot {
    devices: Vec<DeviceProfile>,
    targets: Vec<BuildTarget>,
    source: Option<PathBuf>,
    loaded_at: DateTime<Local>,
}

impl BuildMatrixSnapshot {
    /// Build from a catalog; duplicate (device, firmware) entries keep the first
    pub fn from_catalog(catalog: Catalog, source: Option<PathBuf>) -> Self {
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(catalog.builds.len());
        for mut target in catalog.builds {
            let key = (target.device_id.clone(), target.firmware_id.clone());
            if !seen.insert(key) {
                log::warn!(
                    "Duplicate build target {}/{} ignored",
                    target.device_id,
                    target.firmware_id
                );
                continue;
            }
            if target.toolchain == Toolchain::Idf && target.envs.is_empty() {
                target.envs = vec![IDF_DEFAULT_ENV.to_string()];
            }
            targets.push(target);
        }

        Self {
            devices: catalog.devices,
            targets,
            source,
            loaded_at: Local::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let catalog = Catalog::load(path)?;
        Ok(Self::from_catalog(catalog, Some(path.to_path_buf())))
    }

    /// Re-read the catalog this snapshot came from; in-memory snapshots
    /// return an unchanged copy
    pub fn refresh(&self) -> Result<Self> {
        match &self.source {
            Some(path) => Self::load(path),
            None => Ok(Self {
                loaded_at: Local::now(),
                ..self.clone()
            }),
        }
    }

    pub fn devices(&self) -> &[DeviceProfile] {
        &self.devices
    }

    pub fn targets(&self) -> &[BuildTarget] {
        &self.targets
    }

    pub fn device(&self, id: &str) -> Option<&DeviceProfile> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn target(&self, device_id: &str, firmware_id: &str) -> Option<&BuildTarget> {
        self.targets
            .iter()
            .find(|t| t.device_id == device_id && t.firmware_id == firmware_id)
    }

    pub fn loaded_at(&self) -> DateTime<Local> {
        self.loaded_at
    }
}

impl Default for BuildMatrixSnapshot {
    fn default() -> Self {
        Self::from_catalog(Catalog::builtin(), None)
    }
}

/// Firmware targets registered for a device; empty is valid
pub fn targets_for_device(snapshot: &BuildMatrixSnapshot, device_id: &str) -> Vec<BuildTarget> {
    snapshot
        .targets()
        .iter()
        .filter(|t| t.device_id == device_id)
        .cloned()
        .collect()
}

pub fn envs_for(snapshot: &BuildMatrixSnapshot, device_id: &str, firmware_id: &str) -> Vec<String> {
    snapshot
        .target(device_id, firmware_id)
        .map(|t| t.envs.clone())
        .unwrap_or_default()
}

/// Patches for a (device, firmware) pair; missing or unknown ids yield an empty list
pub fn patches_for(
    snapshot: &BuildMatrixSnapshot,
    repo_root: &Path,
    device_id: Option<&str>,
    firmware_id: Option<&str>,
) -> Vec<Patch> {
    let (Some(device_id), Some(firmware_id)) = (device_id, firmware_id) else {
        return Vec::new();
    };
    match snapshot.target(device_id, firmware_id) {
        Some(target) => list_patches(repo_root, target),
        None => Vec::new(),
    }
}

/// Caller-side selection state. Choosing a device drops everything
/// downstream of it; env and patch lists are always derived fresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSelection {
    pub device_id: Option<String>,
    pub firmware_id: Option<String>,
    pub env_name: Option<String>,
    pub patch_paths: Vec<String>,
}

impl BuildSelection {
    pub fn select_device(&mut self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        if self.device_id.as_deref() != Some(device_id.as_str()) {
            self.firmware_id = None;
            self.env_name = None;
            self.patch_paths.clear();
        }
        self.device_id = Some(device_id);
    }

    pub fn select_firmware(&mut self, firmware_id: impl Into<String>) {
        let firmware_id = firmware_id.into();
        if self.firmware_id.as_deref() != Some(firmware_id.as_str()) {
            self.env_name = None;
            self.patch_paths.clear();
        }
        self.firmware_id = Some(firmware_id);
    }

    /// Envs valid for the current pair
    pub fn envs(&self, snapshot: &BuildMatrixSnapshot) -> Vec<String> {
        match (&self.device_id, &self.firmware_id) {
            (Some(d), Some(f)) => envs_for(snapshot, d, f),
            _ => Vec::new(),
        }
    }

    pub fn patches(&self, snapshot: &BuildMatrixSnapshot, repo_root: &Path) -> Vec<Patch> {
        patches_for(
            snapshot,
            repo_root,
            self.device_id.as_deref(),
            self.firmware_id.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_targets_and_envs() {
        let snapshot = BuildMatrixSnapshot::default();
        let targets = targets_for_device(&snapshot, "t_beam_1w");
        assert_eq!(targets.len(), 2);
        assert!(targets_for_device(&snapshot, "t_deck_plus").is_empty());
        assert_eq!(envs_for(&snapshot, "t_beam_1w", "meshtastic"), vec!["tbeam-1w"]);
        assert!(envs_for(&snapshot, "t_beam_1w", "bruce").is_empty());
    }

    #[test]
    fn test_duplicates_and_idf_placeholder() {
        let mut catalog = Catalog::builtin();
        let duplicate = catalog.builds[0].clone();
        catalog.builds.push(duplicate);
        catalog.builds.push(BuildTarget {
            device_id: "t_deck_plus".to_string(),
            firmware_id: "launcher".to_string(),
            path: "devices/t_deck_plus/firmware/launcher".to_string(),
            envs: vec![],
            build_subdir: None,
            toolchain: Toolchain::Idf,
        });
        let snapshot = BuildMatrixSnapshot::from_catalog(catalog, None);
        assert_eq!(snapshot.targets().len(), 3);
        assert_eq!(envs_for(&snapshot, "t_deck_plus", "launcher"), vec![IDF_DEFAULT_ENV]);
    }

    #[test]
    fn test_patches_for_missing_ids_is_empty() {
        let root = TempDir::new().unwrap();
        let snapshot = BuildMatrixSnapshot::default();
        assert!(patches_for(&snapshot, root.path(), None, Some("meshtastic")).is_empty());
        assert!(patches_for(&snapshot, root.path(), Some("nope"), Some("meshtastic")).is_empty());
    }

    #[test]
    fn test_selection_invalidates_downstream() {
        let snapshot = BuildMatrixSnapshot::default();
        let mut selection = BuildSelection::default();
        selection.select_device("t_beam_1w");
        selection.select_firmware("meshcore");
        selection.env_name = Some("T_Beam_1W_SX1262_repeater".to_string());
        selection.patch_paths.push("patches/001-radio.patch".to_string());
        assert_eq!(selection.envs(&snapshot).len(), 3);

        selection.select_device("t_deck_plus");
        assert_eq!(selection.firmware_id, None);
        assert_eq!(selection.env_name, None);
        assert!(selection.patch_paths.is_empty());
        assert!(selection.envs(&snapshot).is_empty());
    }

    #[test]
    fn test_refresh_rereads_catalog() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.ron");
        Catalog::builtin().save(&path).unwrap();
        let snapshot = BuildMatrixSnapshot::load(&path).unwrap();

        let mut changed = Catalog::builtin();
        changed.builds.retain(|t| t.firmware_id == "meshtastic");
        changed.save(&path).unwrap();

        let refreshed = snapshot.refresh().unwrap();
        assert_eq!(snapshot.targets().len(), 2);
        assert_eq!(refreshed.targets().len(), 1);
    }
}
