//! Build outputs, downloaded releases and backups available for flashing

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::{LabError, Result};
use crate::models::{Artifact, ArtifactKind};

/// Append-only registration log, one JSON object per line
pub const REGISTRY_FILE: &str = ".registry.jsonl";

const BACKUPS_DIR_NAME: &str = "backups";
const OTA_DIR_NAME: &str = "ota";

/// Component images that would write a partial image if flashed alone
const COMPONENT_BINS: &[&str] = &["bootloader.bin", "partitions.bin"];

pub struct ArtifactStore {
    repo_root: PathBuf,
    artifacts_dir: PathBuf,
    firmware_targets: Vec<String>,
    log: Mutex<Vec<Artifact>>,
}

impl ArtifactStore {
    /// Open the store, replaying any existing registration log
    pub fn open(repo_root: PathBuf, artifacts_dir: PathBuf, firmware_targets: Vec<String>) -> Self {
        let log = load_registry(&artifacts_dir.join(REGISTRY_FILE));
        if !log.is_empty() {
            log::debug!("Replayed {} artifact registrations", log.len());
        }
        Self {
            repo_root,
            artifacts_dir,
            firmware_targets,
            log: Mutex::new(log),
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.artifacts_dir.join(BACKUPS_DIR_NAME)
    }

    /// Every flashable binary, optionally narrowed to one firmware id.
    /// Unknown firmware filters are ignored; backups are always included.
    pub fn list(&self, firmware_filter: Option<&str>) -> Vec<Artifact> {
        let filter = firmware_filter
            .map(|f| f.trim().to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .filter(|f| self.firmware_targets.iter().any(|t| t.eq_ignore_ascii_case(f)));

        let mut by_path: BTreeMap<String, Artifact> = BTreeMap::new();
        for artifact in self.scan_builds().into_iter().chain(self.scan_backups()) {
            by_path.insert(artifact.path.clone(), artifact);
        }
        {
            let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            for entry in log.iter() {
                if self.repo_root.join(&entry.path).is_file() {
                    by_path.insert(entry.path.clone(), entry.clone());
                }
            }
        }

        let mut files: Vec<Artifact> = by_path
            .into_values()
            .filter(|a| match &filter {
                None => true,
                Some(_) if a.kind == ArtifactKind::Backup => true,
                Some(f) => a.firmware.as_deref().is_some_and(|fw| fw.eq_ignore_ascii_case(f)),
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
        files
    }

    /// Record a new artifact. The entry is appended to the in-memory log and
    /// persisted with a single write while the log lock is held, so
    /// concurrent registrations are never lost.
    pub fn register(&self, path: &Path, name: &str, kind: ArtifactKind) -> Result<Artifact> {
        let relative = self.relative(path);
        let (device, firmware) = self.owner_from_path(&relative);
        let size = std::fs::metadata(self.repo_root.join(&relative))
            .map(|m| m.len())
            .unwrap_or(0);
        let artifact = Artifact {
            path: relative,
            name: name.to_string(),
            kind,
            device,
            firmware,
            size,
        };

        let mut line = serde_json::to_string(&artifact)?;
        line.push('\n');

        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::create_dir_all(&self.artifacts_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.artifacts_dir.join(REGISTRY_FILE))?;
        file.write_all(line.as_bytes())?;
        log.push(artifact.clone());

        log::info!("📦 Registered {} ({:?})", artifact.path, artifact.kind);
        Ok(artifact)
    }

    /// Absolute path of an artifact referenced by repo-relative path; must
    /// exist and stay inside the artifact directory
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let trimmed = relative.trim();
        if trimmed.is_empty() {
            return Err(LabError::Validation("Artifact path required".to_string()));
        }
        let candidate = if Path::new(trimmed).is_absolute() {
            PathBuf::from(trimmed)
        } else {
            self.repo_root.join(trimmed)
        };
        let resolved = candidate
            .canonicalize()
            .map_err(|_| LabError::Validation(format!("File not found: {}", relative)))?;
        let root = self
            .artifacts_dir
            .canonicalize()
            .map_err(|_| LabError::Validation("Artifact directory does not exist".to_string()))?;
        if !resolved.starts_with(&root) || !resolved.is_file() {
            return Err(LabError::Validation(format!(
                "Path must be a file under artifacts: {}",
                relative
            )));
        }
        Ok(resolved)
    }

    /// Repo-relative string form of `path`
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.repo_root).unwrap_or(path);
        rel.to_string_lossy().replace('\\', "/")
    }

    /// `artifacts/<device>/<firmware>/...` layout
    fn owner_from_path(&self, relative: &str) -> (Option<String>, Option<String>) {
        let absolute = self.repo_root.join(relative);
        let Ok(inner) = absolute.strip_prefix(&self.artifacts_dir) else {
            return (None, None);
        };
        let parts: Vec<String> = inner
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.len() < 3 || parts[0] == BACKUPS_DIR_NAME {
            return (None, None);
        }
        (Some(parts[0].clone()), Some(parts[1].clone()))
    }

    /// `.bin` files directly under `<device>/<firmware>/` or one level below it
    fn scan_builds(&self) -> Vec<Artifact> {
        let base = glob::Pattern::escape(&self.artifacts_dir.to_string_lossy());
        let mut found = Vec::new();
        for pattern in [format!("{}/*/*/*.bin", base), format!("{}/*/*/*/*.bin", base)] {
            let Ok(paths) = glob::glob(&pattern) else {
                continue;
            };
            for path in paths.flatten() {
                if let Some(artifact) = self.build_entry(&path) {
                    found.push(artifact);
                }
            }
        }
        found
    }

    fn build_entry(&self, path: &Path) -> Option<Artifact> {
        let inner = path.strip_prefix(&self.artifacts_dir).ok()?;
        let parts: Vec<String> = inner
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let file_name = parts.last()?;
        if parts[0] == BACKUPS_DIR_NAME || COMPONENT_BINS.contains(&file_name.as_str()) || !path.is_file() {
            return None;
        }
        let kind = if parts.len() == 4 && parts[2] == OTA_DIR_NAME {
            ArtifactKind::Release
        } else {
            ArtifactKind::Artifact
        };
        Some(Artifact {
            path: self.relative(path),
            name: parts.join("/"),
            kind,
            device: Some(parts[0].clone()),
            firmware: Some(parts[1].clone()),
            size: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        })
    }

    fn scan_backups(&self) -> Vec<Artifact> {
        let Ok(entries) = std::fs::read_dir(self.backups_dir()) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|e| e == "bin"))
            .map(|path| Artifact {
                path: self.relative(&path),
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                kind: ArtifactKind::Backup,
                device: None,
                firmware: None,
                size: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            })
            .collect()
    }
}

fn load_registry(path: &Path) -> Vec<Artifact> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Artifact>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Skipping unreadable registry entry: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(root: &Path) -> ArtifactStore {
        ArtifactStore::open(
            root.to_path_buf(),
            root.join("artifacts"),
            vec!["meshtastic".to_string(), "meshcore".to_string()],
        )
    }

    fn touch(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_scan_filters_components_and_firmware() {
        let root = TempDir::new().unwrap();
        let artifacts = root.path().join("artifacts");
        touch(&artifacts.join("t_beam_1w/meshtastic/build_tbeam-1w_1/firmware.bin"), &[1; 16]);
        touch(&artifacts.join("t_beam_1w/meshtastic/build_tbeam-1w_1/bootloader.bin"), &[1]);
        touch(&artifacts.join("t_beam_1w/meshcore/firmware.bin"), &[2]);
        touch(&artifacts.join("t_beam_1w/meshtastic/ota/v2.5_firmware.bin"), &[3]);
        touch(&artifacts.join("backups/backup_t_beam_1w_nvs_20250101_120000.bin"), &[4]);

        let store = open_store(root.path());
        assert_eq!(store.list(None).len(), 4);

        let meshtastic = store.list(Some("meshtastic"));
        assert_eq!(meshtastic.len(), 3);
        assert!(meshtastic.iter().any(|a| a.kind == ArtifactKind::Backup));
        assert!(meshtastic.iter().any(|a| a.kind == ArtifactKind::Release));
        assert!(meshtastic.iter().all(|a| !a.path.ends_with("bootloader.bin")));

        // Unknown filter is ignored
        assert_eq!(store.list(Some("not-a-firmware")).len(), 4);
    }

    #[test]
    fn test_register_persists_and_dedups() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("artifacts/t_beam_1w/meshtastic/build_x/firmware.bin");
        touch(&path, &[0xE9; 64]);

        let store = open_store(root.path());
        let entry = store.register(&path, "firmware.bin", ArtifactKind::Artifact).unwrap();
        assert_eq!(entry.firmware.as_deref(), Some("meshtastic"));
        assert_eq!(entry.size, 64);

        let listed = store.list(Some("meshtastic"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "firmware.bin");

        let reopened = open_store(root.path());
        assert_eq!(reopened.list(None).len(), 1);
        let log = std::fs::read_to_string(root.path().join("artifacts").join(REGISTRY_FILE)).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn test_resolve_stays_inside_artifacts() {
        let root = TempDir::new().unwrap();
        touch(&root.path().join("artifacts/backups/a.bin"), &[1]);
        touch(&root.path().join("secret.bin"), &[1]);
        let store = open_store(root.path());

        assert!(store.resolve("artifacts/backups/a.bin").is_ok());
        assert!(store.resolve("artifacts/../secret.bin").unwrap_err().is_validation());
        assert!(store.resolve("artifacts/backups/missing.bin").is_err());
    }
}
