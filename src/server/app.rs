//! Server application implementation

use anyhow::Result;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use warp::Filter;

use super::ServerConfig;
use crate::config::LabConfig;
use crate::services::LabServices;
use crate::services::port_lock::lock_key;

/// Server application main struct
pub struct ServerApp {
    config: ServerConfig,
    state: Arc<RwLock<ServerState>>,
}

/// Shared state handed to every route
pub struct ServerState {
    pub services: Arc<LabServices>,
    pub config: ServerConfig,
    pub started_at: DateTime<Local>,
    /// Cancel flags of running backups, keyed by port lock key
    pub backup_cancels: HashMap<String, Arc<AtomicBool>>,
}

impl ServerState {
    pub fn new(services: Arc<LabServices>, config: ServerConfig) -> Self {
        Self {
            services,
            config,
            started_at: Local::now(),
            backup_cancels: HashMap::new(),
        }
    }

    /// Ask the backup on `port` (every backup when `None`) to stop after
    /// its current chunk. Returns how many backups were signalled.
    pub fn cancel_backup(&self, port: Option<&str>) -> usize {
        let flags: Vec<&Arc<AtomicBool>> = match port {
            Some(port) => self.backup_cancels.get(&lock_key(port)).into_iter().collect(),
            None => self.backup_cancels.values().collect(),
        };
        for flag in &flags {
            flag.store(true, Ordering::Relaxed);
        }
        flags.len()
    }

    /// Register the cancel flag of a backup starting on `port`; `false` if
    /// a backup already runs there
    pub fn register_backup(&mut self, port: &str, flag: Arc<AtomicBool>) -> bool {
        let key = lock_key(port);
        if self.backup_cancels.contains_key(&key) {
            return false;
        }
        self.backup_cancels.insert(key, flag);
        true
    }

    /// Forget a finished backup's flag, unless another backup replaced it
    pub fn finish_backup(&mut self, port: &str, flag: &Arc<AtomicBool>) {
        let key = lock_key(port);
        if self.backup_cancels.get(&key).is_some_and(|c| Arc::ptr_eq(c, flag)) {
            self.backup_cancels.remove(&key);
        }
    }
}

impl ServerApp {
    pub fn new(config: LabConfig) -> Result<Self> {
        let server_config = config.server.clone();
        let services = Arc::new(LabServices::from_config(config)?);
        Ok(Self::with_services(services, server_config))
    }

    pub fn with_services(services: Arc<LabServices>, config: ServerConfig) -> Self {
        let state = Arc::new(RwLock::new(ServerState::new(services, config.clone())));
        Self { config, state }
    }

    pub fn state(&self) -> Arc<RwLock<ServerState>> {
        self.state.clone()
    }

    /// Run the HTTP server until Ctrl+C
    pub async fn run(self) -> Result<()> {
        {
            let state = self.state.read().await;
            let services = &state.services;
            let snapshot = services.snapshot().await;
            println!("🧪 labflash server starting");
            println!("📁 Repository: {}", services.repo_root().display());
            println!("📦 Artifacts: {}", services.artifacts.artifacts_dir().display());
            println!(
                "🗂️  Catalog: {} ({} devices, {} build targets)",
                services.catalog_path().display(),
                snapshot.devices().len(),
                snapshot.targets().len()
            );
            if services.config().in_container() {
                println!("📦 Containerized mode: serial ports need USB passthrough");
            }
        }

        let routes = crate::server::routes::create_routes(self.state.clone(), self.config.max_upload_bytes());

        let cors = warp::cors()
            .allow_any_origin()
            .allow_headers(vec!["content-type"])
            .allow_methods(vec!["GET", "POST", "OPTIONS"]);
        let logging = crate::server::middleware::logging::with_request_logging();
        let routes = routes.with(logging).with(cors);

        let bind_addr: std::net::SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

        println!("🌍 Server listening on http://{}", bind_addr);
        println!("📄 API endpoints:");
        println!("   GET    /api/v1/flash/ports              - List serial ports (?detect=1 probes chips)");
        println!("   GET    /api/v1/flash/devices            - Device catalog");
        println!("   GET    /api/v1/flash/build-config       - Build matrix");
        println!("   POST   /api/v1/flash/build-config/reload - Re-read the catalog");
        println!("   GET    /api/v1/flash/patches            - Patches for a device/firmware");
        println!("   POST   /api/v1/flash/build              - Build (optionally flash)");
        println!("   POST   /api/v1/flash/build/stream       - Build with streamed log");
        println!("   POST   /api/v1/flash/backup             - Read flash to a .bin");
        println!("   GET    /api/v1/flash/backup/progress    - Progress of the running backup");
        println!("   POST   /api/v1/flash/backup/cancel      - Cancel the running backup");
        println!("   POST   /api/v1/flash/restore            - Write a full image at 0x0");
        println!("   POST   /api/v1/flash/flash              - Write an image");
        println!("   GET    /api/v1/flash/artifacts          - List artifacts");
        println!("   POST   /api/v1/flash/download-release   - Fetch a GitHub release asset");
        println!("   GET    /health                          - Health check");
        println!("🚀 labflash server ready!");

        let cancel_state = self.state.clone();
        let (_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(bind_addr, async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
            println!("ℹ️ Received shutdown signal (Ctrl+C)...");
            cancel_state.read().await.cancel_backup(None);
        });

        server.await;
        println!("🛑 Server shut down gracefully");
        Ok(())
    }
}
