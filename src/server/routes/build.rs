//! Build routes: blocking JSON and streamed `data:` log

use bytes::Bytes;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use warp::Filter;
use warp::reply::Response;

use super::{api_flash, json_reply, services_of, with_server_state};
use crate::errors::LabError;
use crate::models::{BuildOutcome, BuildRequest, BuildResult, BuildState, StreamRecord};
use crate::server::app::ServerState;
use crate::services::LabServices;

pub fn create_build_routes(
    state: Arc<RwLock<ServerState>>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let build = api_flash()
        .and(warp::path("build"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server_state(state.clone()))
        .and_then(build_handler);

    let stream = api_flash()
        .and(warp::path("build"))
        .and(warp::path("stream"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server_state(state))
        .and_then(build_stream_handler);

    build.or(stream).unify()
}

fn outcome_status(outcome: &BuildOutcome) -> u16 {
    outcome.error().map_or(200, |e| e.status_code())
}

fn failure_reply(err: &LabError) -> Response {
    json_reply(&BuildResult::failure(err.to_string()), err.status_code())
}

/// POST /api/v1/flash/build
async fn build_handler(request: BuildRequest, state: Arc<RwLock<ServerState>>) -> Result<Response, warp::Rejection> {
    log::info!(
        "🔨 Build request: {}/{} env={} patches={} flash_after={}",
        request.device_id,
        request.firmware_id,
        request.env_name,
        request.patch_paths.len(),
        request.flash_after
    );
    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;

    // Detached so a dropped client cannot interrupt the tree revert
    let task = tokio::spawn(async move { services.builds.submit(&request, &snapshot, None).await });
    match task.await {
        Ok(Ok(outcome)) => Ok(json_reply(&outcome.to_result(), outcome_status(&outcome))),
        Ok(Err(e)) => {
            log::warn!("⚠️ Build rejected: {}", e);
            Ok(failure_reply(&e))
        }
        Err(e) => {
            log::error!("❌ Build task failed: {}", e);
            Ok(failure_reply(&LabError::Execution(format!("Build task failed: {}", e))))
        }
    }
}

/// POST /api/v1/flash/build/stream
async fn build_stream_handler(
    request: BuildRequest,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;

    // Reject bad requests with a plain JSON error before any stream starts
    if let Err(e) = services.builds.validate(&request, &snapshot) {
        log::warn!("⚠️ Streamed build rejected: {}", e);
        return Ok(failure_reply(&e));
    }
    log::info!("📡 Streaming build {}/{} env={}", request.device_id, request.firmware_id, request.env_name);

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(run_streamed_build(services, request, snapshot, out_tx));

    let body = futures_util::stream::unfold(out_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<Bytes, Infallible>(Bytes::from(line)), rx))
    });
    let mut response = Response::new(warp::hyper::Body::wrap_stream(body));
    response.headers_mut().insert(
        warp::http::header::CONTENT_TYPE,
        warp::http::HeaderValue::from_static("text/event-stream"),
    );
    response.headers_mut().insert(
        warp::http::header::CACHE_CONTROL,
        warp::http::HeaderValue::from_static("no-cache"),
    );
    Ok(response)
}

/// Forward build log lines as delta records, then one terminal record.
/// Keeps running when the client goes away.
async fn run_streamed_build(
    services: Arc<LabServices>,
    request: BuildRequest,
    snapshot: Arc<crate::services::BuildMatrixSnapshot>,
    out: mpsc::UnboundedSender<String>,
) {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let send_line = |line: String| {
        let mut text = line.trim_end_matches(['\r', '\n']).to_string();
        text.push('\n');
        let _ = out.send(StreamRecord::delta(text).to_line());
    };

    let submit = services.builds.submit(&request, &snapshot, Some(line_tx));
    tokio::pin!(submit);
    let outcome = loop {
        tokio::select! {
            biased;
            Some(line) = line_rx.recv() => send_line(line),
            outcome = &mut submit => break outcome,
        }
    };
    while let Ok(line) = line_rx.try_recv() {
        send_line(line);
    }

    let result = match outcome {
        Ok(outcome) => outcome.to_result(),
        // Validation already passed, so the run itself failed
        Err(e) => BuildResult {
            state: Some(BuildState::Failed),
            ..BuildResult::failure(e.to_string())
        },
    };
    if result.success {
        log::info!("✅ Streamed build finished: {}", result.path.as_deref().unwrap_or("-"));
    } else {
        log::warn!("⚠️ Streamed build failed: {}", result.error.as_deref().unwrap_or("unknown"));
    }
    let _ = out.send(StreamRecord::done_with_result(result).to_line());
}
