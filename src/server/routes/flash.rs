//! Backup, restore and flash routes

use bytes::Buf;
use futures_util::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use warp::Filter;
use warp::reply::Response;

use super::{api_flash, error_reply, json_reply, services_of, with_server_state};
use crate::errors::{LabError, Result as LabResult};
use crate::models::{BackupRequest, ImageSource, OperationResponse, TransferRequest, parse_address};
use crate::server::app::ServerState;

/// Create all flash-related routes
pub fn create_flash_routes(
    state: Arc<RwLock<ServerState>>,
    max_upload_bytes: u64,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let backup = api_flash()
        .and(warp::path("backup"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server_state(state.clone()))
        .and_then(backup_handler);

    let progress = api_flash()
        .and(warp::path("backup"))
        .and(warp::path("progress"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_server_state(state.clone()))
        .and_then(progress_handler);

    let cancel = api_flash()
        .and(warp::path("backup"))
        .and(warp::path("cancel"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_server_state(state.clone()))
        .and_then(cancel_handler);

    let restore = api_flash()
        .and(warp::path("restore"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::multipart::form().max_length(max_upload_bytes))
        .and(with_server_state(state.clone()))
        .and_then(restore_handler);

    let flash = api_flash()
        .and(warp::path("flash"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::multipart::form().max_length(max_upload_bytes))
        .and(with_server_state(state))
        .and_then(flash_handler);

    backup
        .or(progress)
        .unify()
        .or(cancel)
        .unify()
        .or(restore)
        .unify()
        .or(flash)
        .unify()
}

/// Sets a backup's cancel flag when the request is dropped before the
/// backup finished, so a client disconnect releases the port
struct CancelOnDrop(Option<Arc<AtomicBool>>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            log::info!("⏹️  Backup request dropped; cancelling");
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// POST /api/v1/flash/backup: the image itself on success
async fn backup_handler(request: BackupRequest, state: Arc<RwLock<ServerState>>) -> Result<Response, warp::Rejection> {
    log::info!(
        "💾 Backup request: {} on {} ({})",
        request.device_id,
        request.port,
        request.backup_type.as_str()
    );
    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;

    let cancel = Arc::new(AtomicBool::new(false));
    if !state.write().await.register_backup(&request.port, cancel.clone()) {
        return Ok(error_reply(&LabError::PortBusy {
            port: request.port.clone(),
        }));
    }
    let guard = CancelOnDrop(Some(cancel.clone()));

    let flasher = services.flasher.clone();
    let task_state = state.clone();
    let task = tokio::spawn(async move {
        let result = flasher.backup(&request, &snapshot, Some(cancel.clone())).await;
        task_state.write().await.finish_backup(&request.port, &cancel);
        result
    });
    let result = task
        .await
        .unwrap_or_else(|e| Err(LabError::Execution(format!("Backup task failed: {}", e))));
    guard.disarm();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            log::warn!("⚠️ Backup failed: {}", e);
            return Ok(error_reply(&e));
        }
    };
    let data = match tokio::fs::read(&outcome.path).await {
        Ok(data) => data,
        Err(e) => return Ok(error_reply(&LabError::Io(e))),
    };

    let mut response = Response::new(data.into());
    let headers = response.headers_mut();
    headers.insert(
        warp::http::header::CONTENT_TYPE,
        warp::http::HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) =
        warp::http::HeaderValue::from_str(&format!("attachment; filename=\"{}\"", outcome.file_name))
    {
        headers.insert(warp::http::header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

fn port_param(query: &HashMap<String, String>) -> Option<&str> {
    query.get("port").map(|p| p.trim()).filter(|p| !p.is_empty())
}

/// GET /api/v1/flash/backup/progress[?port=]
async fn progress_handler(
    query: HashMap<String, String>,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    let progress = match port_param(&query) {
        Some(port) => services.flasher.progress_for(port),
        None => services.flasher.progress(),
    };
    Ok(json_reply(&progress, 200))
}

/// POST /api/v1/flash/backup/cancel[?port=]: without a port every running
/// backup is cancelled
async fn cancel_handler(
    query: HashMap<String, String>,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    let signalled = state.read().await.cancel_backup(port_param(&query));
    if signalled > 0 {
        log::info!("⏹️  Cancellation requested for {} backup(s)", signalled);
        Ok(json_reply(&OperationResponse::ok("Cancellation requested"), 200))
    } else {
        Ok(json_reply(&OperationResponse::failed("No backup running"), 409))
    }
}

/// POST /api/v1/flash/restore (multipart `port, device_id, path | file`)
async fn restore_handler(
    form: warp::multipart::FormData,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    transfer(form, state, false).await
}

/// POST /api/v1/flash/flash (multipart `port, device_id, addr?, path | file`)
async fn flash_handler(
    form: warp::multipart::FormData,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    transfer(form, state, true).await
}

async fn transfer(
    form: warp::multipart::FormData,
    state: Arc<RwLock<ServerState>>,
    is_flash: bool,
) -> Result<Response, warp::Rejection> {
    let request = match parse_transfer_form(form).await {
        Ok(request) => request,
        Err(e) => {
            log::warn!("⚠️ Rejected transfer form: {}", e);
            return Ok(operation_failure(&e));
        }
    };
    log::info!(
        "📡 {} request: {} on {} from {}",
        if is_flash { "Flash" } else { "Restore" },
        request.device_id,
        request.port,
        request.source.describe()
    );

    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;
    let flasher = services.flasher.clone();
    let task = tokio::spawn(async move {
        if is_flash {
            flasher.flash(request, &snapshot).await
        } else {
            flasher.restore(request, &snapshot).await
        }
    });
    let result = task
        .await
        .unwrap_or_else(|e| Err(LabError::Execution(format!("Transfer task failed: {}", e))));

    match result {
        Ok(report) => Ok(json_reply(&OperationResponse::ok(report.message), 200)),
        Err(e) => Ok(operation_failure(&e)),
    }
}

fn operation_failure(err: &LabError) -> Response {
    json_reply(&OperationResponse::failed(err.to_string()), err.status_code())
}

/// Collect the multipart fields of a restore or flash request
async fn parse_transfer_form(mut form: warp::multipart::FormData) -> LabResult<TransferRequest> {
    let mut port = String::new();
    let mut device_id = String::new();
    let mut addr = None;
    let mut path = None;
    let mut upload = None;

    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| LabError::Validation(format!("Error reading multipart: {}", e)))?
    {
        let name = part.name().to_string();
        let file_name = part.filename().map(str::to_string);
        let data = part
            .stream()
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(chunk.chunk());
                Ok(acc)
            })
            .await
            .map_err(|e| LabError::Validation(format!("Error reading field {}: {}", name, e)))?;

        match name.as_str() {
            "file" => {
                if !data.is_empty() {
                    upload = Some((file_name.unwrap_or_default(), data));
                }
            }
            "port" => port = field_text(&name, data)?,
            "device_id" => device_id = field_text(&name, data)?,
            "path" => path = Some(field_text(&name, data)?),
            "addr" => {
                let raw = field_text(&name, data)?;
                if !raw.trim().is_empty() {
                    addr = Some(parse_address(&raw)?);
                }
            }
            other => log::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let source = ImageSource::resolve(upload, path)?;
    Ok(TransferRequest {
        port,
        device_id,
        source,
        addr,
    })
}

fn field_text(name: &str, data: Vec<u8>) -> LabResult<String> {
    String::from_utf8(data)
        .map(|s| s.trim().to_string())
        .map_err(|_| LabError::Validation(format!("Invalid UTF-8 in {}", name)))
}
