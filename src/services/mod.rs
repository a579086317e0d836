//! Orchestration services shared by the CLI and the HTTP server
//!
//! Everything here runs against an explicit [`BuildMatrixSnapshot`]; the
//! snapshot only changes when [`LabServices::refresh_matrix`] is called.

pub mod artifact_store;
pub mod build_executor;
pub mod build_matrix;
pub mod flash_executor;
pub mod patches;
pub mod port_lock;
pub mod port_registry;
pub mod release;
pub mod stream_relay;
pub mod tool_runner;

pub use artifact_store::ArtifactStore;
pub use build_executor::BuildExecutor;
pub use build_matrix::{BuildMatrixSnapshot, BuildSelection};
pub use flash_executor::FlashExecutor;
pub use port_lock::{PortLease, PortLocks};
pub use port_registry::{PortRegistry, PortSource, SystemPortSource};
pub use release::ReleaseDownloader;
pub use stream_relay::StreamDecoder;
pub use tool_runner::{ProcessRunner, ToolRunner};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::LabConfig;

/// All services wired from one configuration
pub struct LabServices {
    config: LabConfig,
    snapshot: RwLock<Arc<BuildMatrixSnapshot>>,
    pub registry: PortRegistry,
    pub builds: BuildExecutor,
    pub flasher: Arc<FlashExecutor>,
    pub artifacts: Arc<ArtifactStore>,
    pub releases: ReleaseDownloader,
}

impl LabServices {
    /// Production wiring: OS serial ports and real child processes
    pub fn from_config(config: LabConfig) -> Result<Self> {
        let snapshot = BuildMatrixSnapshot::load(&config.catalog_path())
            .with_context(|| format!("Failed to load catalog {}", config.catalog_path().display()))?;
        Self::with_parts(
            config,
            snapshot,
            Arc::new(ProcessRunner::new()),
            Arc::new(SystemPortSource),
        )
    }

    /// Wire services around a given snapshot, tool runner and port source
    pub fn with_parts(
        config: LabConfig,
        snapshot: BuildMatrixSnapshot,
        runner: Arc<dyn ToolRunner>,
        ports: Arc<dyn PortSource>,
    ) -> Result<Self> {
        let locks = PortLocks::new();
        let artifacts = Arc::new(ArtifactStore::open(
            config.repo_root.clone(),
            config.artifacts_dir(),
            config.firmware_targets.clone(),
        ));

        let registry = PortRegistry::new(
            ports,
            runner.clone(),
            locks.clone(),
            config.tools.esptool.clone(),
            Duration::from_secs(config.transfer.probe_timeout_secs),
            config.in_container(),
        );
        let flasher = Arc::new(FlashExecutor::new(
            runner.clone(),
            locks,
            artifacts.clone(),
            config.tools.esptool.clone(),
            config.transfer.clone(),
        )
        .with_container(config.in_container()));
        let builds = BuildExecutor::new(
            runner,
            artifacts.clone(),
            flasher.clone(),
            config.repo_root.clone(),
            config.tools.clone(),
            Duration::from_secs(config.transfer.git_timeout_secs),
        );
        let releases = ReleaseDownloader::new(artifacts.clone()).context("Failed to create HTTP client")?;

        log::debug!(
            "Services ready: repo {} ({} devices, {} build targets)",
            config.repo_root.display(),
            snapshot.devices().len(),
            snapshot.targets().len()
        );

        Ok(Self {
            config,
            snapshot: RwLock::new(Arc::new(snapshot)),
            registry,
            builds,
            flasher,
            artifacts,
            releases,
        })
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn repo_root(&self) -> &Path {
        &self.config.repo_root
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.config.catalog_path()
    }

    /// The current snapshot; callers keep it for the whole operation
    pub async fn snapshot(&self) -> Arc<BuildMatrixSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Re-read the catalog and swap in the new snapshot. Operations already
    /// running keep the snapshot they started with.
    pub async fn refresh_matrix(&self) -> Result<Arc<BuildMatrixSnapshot>> {
        let current = self.snapshot().await;
        let fresh = Arc::new(current.refresh().context("Failed to refresh build matrix")?);
        *self.snapshot.write().await = fresh.clone();
        log::info!(
            "🔄 Build matrix refreshed: {} targets",
            fresh.targets().len()
        );
        Ok(fresh)
    }
}
