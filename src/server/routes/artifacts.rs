//! Artifact listing and release download routes

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use warp::Filter;
use warp::reply::Response;

use super::{api_flash, json_reply, services_of, with_server_state};
use crate::models::{ArtifactsResponse, DownloadReleaseRequest, DownloadReleaseResponse};
use crate::server::app::ServerState;

pub fn create_artifact_routes(
    state: Arc<RwLock<ServerState>>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let list = api_flash()
        .and(warp::path("artifacts"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_server_state(state.clone()))
        .and_then(list_artifacts_handler);

    let download = api_flash()
        .and(warp::path("download-release"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server_state(state))
        .and_then(download_release_handler);

    list.or(download).unify()
}

/// GET /api/v1/flash/artifacts?firmware=
async fn list_artifacts_handler(
    query: HashMap<String, String>,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    let files = services.artifacts.list(query.get("firmware").map(String::as_str));
    Ok(json_reply(&ArtifactsResponse { files }, 200))
}

/// POST /api/v1/flash/download-release
async fn download_release_handler(
    request: DownloadReleaseRequest,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    log::info!(
        "📥 Release download: {}/{} tag={}",
        request.owner,
        request.repo,
        request.tag.as_deref().unwrap_or("latest")
    );
    let services = services_of(&state).await;
    match services.releases.download(&request).await {
        Ok(artifact) => Ok(json_reply(
            &DownloadReleaseResponse {
                success: true,
                path: Some(artifact.path),
                error: None,
            },
            200,
        )),
        Err(e) => {
            log::warn!("⚠️ Release download failed: {}", e);
            Ok(json_reply(
                &DownloadReleaseResponse {
                    success: false,
                    path: None,
                    error: Some(e.to_string()),
                },
                e.status_code(),
            ))
        }
    }
}
