//! labflash server module
//!
//! HTTP surface over the orchestration services: port discovery, builds,
//! backups, restores, flashing and artifact listing.

pub mod app;
pub mod middleware;
pub mod routes;

pub use app::*;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::LabConfig;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server listening address
    pub bind_address: String,
    /// Server listening port
    pub port: u16,
    /// Maximum upload size for restore and flash images (in MB)
    pub max_upload_mb: u64,
    /// Emit JSON log lines instead of human-readable output
    pub structured_logs: bool,
    /// Also append logs to this file
    pub log_file: Option<PathBuf>,
    /// Default log level when RUST_LOG is unset
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_upload_mb: 32,
            structured_logs: false,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

/// Start the labflash server and run until Ctrl+C
pub async fn start_server(config: LabConfig) -> Result<()> {
    let app = ServerApp::new(config)?;
    app.run().await
}
