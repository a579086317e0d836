//! Application configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::server::ServerConfig;

/// Environment variable overriding `repo_root`
pub const REPO_ROOT_ENV: &str = "LABFLASH_REPO_ROOT";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "labflash.toml";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Root of the lab repository (firmware sources, scripts, artifacts)
    pub repo_root: PathBuf,
    /// Artifact directory; `<repo_root>/artifacts` when unset
    pub artifacts_dir: Option<PathBuf>,
    /// Device catalog and build matrix (RON); `<repo_root>/labflash-catalog.ron` when unset
    pub catalog_path: Option<PathBuf>,
    /// Force containerized mode on or off; auto-detected when unset
    pub container: Option<bool>,
    /// Known firmware ids, used to validate artifact filters
    pub firmware_targets: Vec<String>,
    /// External tool command names
    pub tools: ToolsConfig,
    /// Serial transfer tuning
    pub transfer: TransferConfig,
    /// HTTP server settings
    pub server: ServerConfig,
}

/// External tool command names, tried in order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub esptool: Vec<String>,
    pub platformio: Vec<String>,
    pub git: String,
    /// IDF build script, relative to the repo root
    pub idf_build_script: String,
}

/// Serial transfer timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Per-attempt chip probe timeout
    pub probe_timeout_secs: u64,
    /// Timeout for single-shot esptool reads and writes
    pub esptool_timeout_secs: u64,
    /// Timeout for one chunk of a full backup
    pub chunk_timeout_secs: u64,
    pub chunk_size: u64,
    pub chunk_retries: u32,
    pub chunk_retry_delay_ms: u64,
    /// Timeout for git reset/apply steps
    pub git_timeout_secs: u64,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            artifacts_dir: None,
            catalog_path: None,
            container: None,
            firmware_targets: [
                "meshtastic",
                "meshcore",
                "launcher",
                "bruce",
                "ghost",
                "marauder",
                "flipper_firmware",
                "unleashed",
                "roguemaster",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            tools: ToolsConfig::default(),
            transfer: TransferConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            esptool: vec!["esptool".to_string(), "esptool.py".to_string()],
            platformio: vec!["pio".to_string(), "platformio".to_string()],
            git: "git".to_string(),
            idf_build_script: "scripts/lab-build.sh".to_string(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 4,
            esptool_timeout_secs: 300,
            chunk_timeout_secs: 180,
            chunk_size: 0x100000,
            chunk_retries: 3,
            chunk_retry_delay_ms: 2000,
            git_timeout_secs: 30,
        }
    }
}

impl LabConfig {
    /// Load from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<LabConfig>(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            log::debug!("Config file {} not found, using defaults", path.display());
            LabConfig::default()
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply environment overrides through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(REPO_ROOT_ENV).filter(|v| !v.trim().is_empty()) {
            self.repo_root = PathBuf::from(root.trim());
        }
        self
    }

    /// Config rooted at `repo_root` with everything else default
    pub fn for_repo(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            ..Default::default()
        }
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| self.repo_root.join("artifacts"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.artifacts_dir().join("backups")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.repo_root.join("labflash-catalog.ron"))
    }

    /// Containerized when forced by config, when `/.dockerenv` exists, or
    /// when the repo is mounted at `/workspace`
    pub fn in_container(&self) -> bool {
        self.container.unwrap_or_else(|| {
            Path::new("/.dockerenv").exists() || self.repo_root == Path::new("/workspace")
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }
}
