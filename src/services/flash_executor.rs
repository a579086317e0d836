//! Backup, restore and flash transfers over an exclusively owned serial port

use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::artifact_store::ArtifactStore;
use super::build_matrix::BuildMatrixSnapshot;
use super::port_lock::{PortLocks, lock_key};
use super::tool_runner::{RunContext, ToolCommand, ToolRunner, run_with_fallback};
use crate::config::TransferConfig;
use crate::errors::{LabError, Result};
use crate::models::{
    BackupOutcome, BackupPhase, BackupProgress, BackupRequest, BackupScope, DeviceProfile,
    FlashMethod, ImageSource, TransferReport, TransferRequest,
};
use crate::utils::esptool_utils::{
    check_image, classify_failure, classify_tool_failure, infer_flash_address,
    sanitize_backup_name,
};

/// Bytes of an image inspected before writing
const IMAGE_HEADER_LEN: usize = 64;

/// Numbered variants tried when a backup name is taken
const MAX_NAME_SUFFIX: u32 = 999;

/// Progress of every port's latest backup
#[derive(Debug, Default)]
struct ProgressBoard {
    by_port: HashMap<String, BackupProgress>,
    latest: Option<String>,
}

/// Serial transfers against devices from the catalog
pub struct FlashExecutor {
    runner: Arc<dyn ToolRunner>,
    locks: PortLocks,
    store: Arc<ArtifactStore>,
    esptool: Vec<String>,
    transfer: TransferConfig,
    progress: Arc<Mutex<ProgressBoard>>,
    in_container: bool,
}

impl FlashExecutor {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        locks: PortLocks,
        store: Arc<ArtifactStore>,
        esptool: Vec<String>,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            runner,
            locks,
            store,
            esptool,
            transfer,
            progress: Arc::new(Mutex::new(ProgressBoard::default())),
            in_container: false,
        }
    }

    /// Inside a container, device nodes only exist when USB is passed through
    pub fn with_container(mut self, in_container: bool) -> Self {
        self.in_container = in_container;
        self
    }

    pub fn locks(&self) -> &PortLocks {
        &self.locks
    }

    /// Snapshot of the most recently started backup's progress
    pub fn progress(&self) -> BackupProgress {
        let board = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        board
            .latest
            .as_ref()
            .and_then(|key| board.by_port.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the latest backup on `port` (or its cu/tty sibling)
    pub fn progress_for(&self, port: &str) -> BackupProgress {
        let board = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        board.by_port.get(&lock_key(port)).cloned().unwrap_or_default()
    }

    fn start_progress(&self, port: &str, total_chunks: u32) {
        let key = lock_key(port);
        let mut board = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        board.by_port.insert(
            key.clone(),
            BackupProgress {
                port: Some(port.to_string()),
                pct: 0,
                chunk: 0,
                total_chunks,
                status: BackupPhase::Reading,
                error: None,
            },
        );
        board.latest = Some(key);
    }

    fn update_progress(&self, port: &str, update: impl FnOnce(&mut BackupProgress)) {
        let mut board = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(progress) = board.by_port.get_mut(&lock_key(port)) {
            update(progress);
        }
    }

    /// Shared precondition: port and device id present, device known and
    /// reachable over serial
    fn target_device(&self, port: &str, device_id: &str, snapshot: &BuildMatrixSnapshot) -> Result<DeviceProfile> {
        if port.trim().is_empty() {
            return Err(LabError::MissingTarget("port"));
        }
        if device_id.trim().is_empty() {
            return Err(LabError::MissingTarget("device_id"));
        }
        let port = port.trim();
        if self.in_container && port.starts_with("/dev/") && !Path::new(port).exists() {
            return Err(LabError::NoUsbPassthrough(format!(
                "{} is not visible inside the container; pass the device through or run on the host",
                port
            )));
        }
        let device = snapshot
            .device(device_id.trim())
            .cloned()
            .ok_or_else(|| LabError::Validation(format!("Unknown device: {}", device_id)))?;
        if device.flash_method == FlashMethod::Uf2 {
            return Err(LabError::Validation(format!(
                "{} uses UF2 flashing; copy a UF2 file to its mass-storage drive instead",
                device.id
            )));
        }
        Ok(device)
    }

    /// Read a flash region into `artifacts/backups/`. Full backups are read
    /// in retried chunks; the file only appears once every chunk succeeded.
    pub async fn backup(
        &self,
        request: &BackupRequest,
        snapshot: &BuildMatrixSnapshot,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<BackupOutcome> {
        let device = self.target_device(&request.port, &request.device_id, snapshot)?;
        let port = request.port.trim();
        let (addr, size) = request.backup_type.region(&device);

        let file_name = request
            .name
            .as_deref()
            .and_then(sanitize_backup_name)
            .unwrap_or_else(|| {
                format!(
                    "backup_{}_{}_{}.bin",
                    device.id,
                    request.backup_type.as_str(),
                    Local::now().format("%Y%m%d_%H%M%S")
                )
            });

        let _lease = self.locks.acquire(port)?;
        log::info!(
            "💾 Backing up {} ({}, {} bytes at 0x{:X}) from {}",
            device.id,
            request.backup_type.as_str(),
            size,
            addr,
            port
        );

        let backups_dir = self.store.backups_dir();
        tokio::fs::create_dir_all(&backups_dir).await?;
        let staging = StagingDir::create(&backups_dir).await?;

        let (chunk_size, retries, chunk_timeout) = match request.backup_type {
            BackupScope::Full => (
                self.transfer.chunk_size.max(1),
                self.transfer.chunk_retries.max(1),
                Duration::from_secs(self.transfer.chunk_timeout_secs),
            ),
            BackupScope::App | BackupScope::Nvs => (
                size,
                1,
                Duration::from_secs(self.transfer.esptool_timeout_secs),
            ),
        };
        let ctx = RunContext {
            cancel: cancel.clone(),
            lines: None,
        };

        let total_chunks = size.div_ceil(chunk_size) as u32;
        self.start_progress(port, total_chunks);

        let mut chunks = Vec::with_capacity(total_chunks as usize);
        let mut offset = u64::from(addr);
        let end = offset + size;
        while offset < end {
            if is_cancelled(&cancel) {
                self.update_progress(port, |p| p.status = BackupPhase::Cancelled);
                log::warn!("⏹️  Backup of {} cancelled at 0x{:X}", port, offset);
                return Err(LabError::Cancelled);
            }
            let len = chunk_size.min(end - offset);
            let chunk_path = staging.path().join(format!("chunk_{:08x}.bin", offset));

            if let Err(e) = self
                .read_chunk(&device, port, offset, len, &chunk_path, retries, chunk_timeout, &ctx)
                .await
            {
                let reason = e.to_string();
                self.update_progress(port, |p| {
                    p.status = if matches!(e, LabError::Cancelled) {
                        BackupPhase::Cancelled
                    } else {
                        BackupPhase::Error
                    };
                    p.error = Some(format!("Failed at 0x{:X}: {}", offset, reason));
                });
                log::error!("❌ Backup of {} failed at 0x{:X}: {}", port, offset, reason);
                return Err(e);
            }

            chunks.push(chunk_path);
            offset += len;
            let done = chunks.len() as u32;
            self.update_progress(port, |p| {
                p.chunk = done;
                p.pct = ((100 * done) / total_chunks.max(1)) as u8;
            });
        }

        self.update_progress(port, |p| {
            p.pct = 100;
            p.status = BackupPhase::Assembling;
        });
        let assembled = staging.path().join("assembled.part");
        let mut out = tokio::fs::File::create(&assembled).await?;
        for chunk in &chunks {
            let data = tokio::fs::read(chunk).await?;
            out.write_all(&data).await?;
        }
        out.flush().await?;
        drop(out);

        let (final_path, file_name) = publish_backup(&assembled, &backups_dir, &file_name).await?;
        self.update_progress(port, |p| p.status = BackupPhase::Done);
        log::info!("✅ Backup saved to {}", final_path.display());

        Ok(BackupOutcome {
            path: final_path,
            file_name,
            size,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_chunk(
        &self,
        device: &DeviceProfile,
        port: &str,
        offset: u64,
        len: u64,
        chunk_path: &Path,
        retries: u32,
        timeout: Duration,
        ctx: &RunContext,
    ) -> Result<()> {
        let command = ToolCommand::new("esptool")
            .args(["--chip", device.chip.as_str(), "--port", port, "read-flash"])
            .arg(offset.to_string())
            .arg(len.to_string())
            .arg(chunk_path.to_string_lossy());

        let mut last_error = LabError::Transfer(format!("Read failed at offset 0x{:X}", offset));
        for attempt in 1..=retries {
            if ctx.is_cancelled() {
                return Err(LabError::Cancelled);
            }
            match run_with_fallback(self.runner.as_ref(), &self.esptool, &command, timeout, ctx).await {
                Ok(out) if out.success && file_len(chunk_path).await == Some(len) => return Ok(()),
                Ok(out) if out.success => {
                    last_error = LabError::Transfer(format!(
                        "Short read at 0x{:X}: expected {} bytes",
                        offset, len
                    ));
                }
                Ok(out) => last_error = classify_failure(&out.output, port),
                Err(failure) => {
                    let err = classify_tool_failure(failure, port);
                    if matches!(err, LabError::Cancelled | LabError::Execution(_)) {
                        return Err(err);
                    }
                    last_error = err;
                }
            }
            log::warn!(
                "⚠️ Chunk at 0x{:X} failed (attempt {}/{}): {}",
                offset,
                attempt,
                retries,
                last_error
            );
            if attempt < retries && self.transfer.chunk_retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.transfer.chunk_retry_delay_ms)).await;
            }
        }
        Err(last_error)
    }

    /// Write an image to address 0x0
    pub async fn restore(&self, request: TransferRequest, snapshot: &BuildMatrixSnapshot) -> Result<TransferReport> {
        self.write_image(request, snapshot, Some(0), "Restore").await
    }

    /// Write an image to an explicit address, or one inferred from its path
    pub async fn flash(&self, request: TransferRequest, snapshot: &BuildMatrixSnapshot) -> Result<TransferReport> {
        self.write_image(request, snapshot, None, "Flash").await
    }

    async fn write_image(
        &self,
        request: TransferRequest,
        snapshot: &BuildMatrixSnapshot,
        forced_addr: Option<u32>,
        operation: &str,
    ) -> Result<TransferReport> {
        let device = self.target_device(&request.port, &request.device_id, snapshot)?;
        let port = request.port.trim().to_string();

        let (image, inferred_addr) = match &request.source {
            ImageSource::ArtifactPath(path) => (ImageFile::Stored(self.store.resolve(path)?), infer_flash_address(path)),
            ImageSource::Upload { bytes, .. } => (ImageFile::upload(bytes).await?, 0),
        };
        let addr = forced_addr.or(request.addr).unwrap_or(inferred_addr);

        let image_len = tokio::fs::metadata(image.path()).await?.len();
        let header = read_header(image.path()).await?;
        check_image(&header, image_len, addr, &device)?;

        let _lease = self.locks.acquire(&port)?;
        log::info!(
            "📡 {} {} ({} bytes) to {} at 0x{:X}",
            operation,
            request.source.describe(),
            image_len,
            port,
            addr
        );

        let mut command = ToolCommand::new("esptool").args([
            "--chip",
            device.chip.as_str(),
            "--port",
            port.as_str(),
            "write-flash",
        ]);
        if let Some(mode) = &device.flash_mode {
            command = command.args(["--flash_mode", mode.as_str()]);
        }
        command = command
            .args(["--flash_size", device.flash_size.as_str()])
            .arg(format!("0x{:x}", addr))
            .arg(image.path().to_string_lossy());

        let timeout = Duration::from_secs(self.transfer.esptool_timeout_secs);
        let outcome = run_with_fallback(
            self.runner.as_ref(),
            &self.esptool,
            &command,
            timeout,
            &RunContext::default(),
        )
        .await;

        match outcome {
            Ok(out) if out.success => {
                let message = format!(
                    "{} of {} to {} at 0x{:X} complete",
                    operation,
                    request.source.describe(),
                    device.id,
                    addr
                );
                log::info!("✅ {}", message);
                Ok(TransferReport {
                    message,
                    addr,
                    bytes: image_len,
                })
            }
            Ok(out) => {
                let err = classify_failure(&out.output, &port);
                log::error!("❌ {} failed on {}: {}", operation, port, err);
                Err(err)
            }
            Err(failure) => Err(classify_tool_failure(failure, &port)),
        }
    }
}

/// Link the assembled image into the backups directory under `file_name`,
/// or `<stem>_<n>.<ext>` when that name is taken. Existing backups are
/// never replaced.
async fn publish_backup(assembled: &Path, backups_dir: &Path, file_name: &str) -> Result<(PathBuf, String)> {
    for n in 0..=MAX_NAME_SUFFIX {
        let name = if n == 0 {
            file_name.to_string()
        } else {
            numbered_name(file_name, n)
        };
        let dest = backups_dir.join(&name);
        match tokio::fs::hard_link(assembled, &dest).await {
            Ok(()) => {
                if name != file_name {
                    log::warn!("⚠️ {} already exists; saved as {}", file_name, name);
                }
                return Ok((dest, name));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(LabError::Validation(format!(
        "Too many backups named {}; choose another name",
        file_name
    )))
}

fn numbered_name(file_name: &str, n: u32) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, n, ext),
        _ => format!("{}_{}", file_name, n),
    }
}

fn is_cancelled(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed))
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

async fn read_header(path: &Path) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = vec![0u8; IMAGE_HEADER_LEN];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    header.truncate(filled);
    Ok(header)
}

/// Hidden per-backup working directory, removed on drop
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    async fn create(parent: &Path) -> Result<Self> {
        let path = parent.join(format!(".partial-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::debug!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Image on disk; uploads live in a temp file removed on drop
enum ImageFile {
    Stored(PathBuf),
    Upload(PathBuf),
}

impl ImageFile {
    async fn upload(bytes: &[u8]) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("labflash-upload-{}.bin", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, bytes).await?;
        Ok(ImageFile::Upload(path))
    }

    fn path(&self) -> &Path {
        match self {
            ImageFile::Stored(path) | ImageFile::Upload(path) => path,
        }
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        if let ImageFile::Upload(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
