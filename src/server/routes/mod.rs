//! HTTP routes for the labflash server

pub mod artifacts;
pub mod build;
pub mod flash;
pub mod health;
pub mod ports;

use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::RwLock;
use warp::{Filter, Reply};
use warp::http::StatusCode;
use warp::reply::Response;

use crate::errors::LabError;
use crate::models::ErrorResponse;
use crate::server::app::ServerState;
use crate::services::LabServices;

/// Create all server routes. `max_upload_bytes` bounds multipart image uploads.
pub fn create_routes(
    state: Arc<RwLock<ServerState>>,
    max_upload_bytes: u64,
) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    let api = ports::create_port_routes(state.clone())
        .or(build::create_build_routes(state.clone()))
        .or(flash::create_flash_routes(state.clone(), max_upload_bytes))
        .or(artifacts::create_artifact_routes(state))
        .or(health::create_health_route());

    api.map(|reply| Reply::into_response(reply)).recover(handle_rejection).unify()
}

/// Helper function to pass server state to handlers
pub(crate) fn with_server_state(
    state: Arc<RwLock<ServerState>>,
) -> impl Filter<Extract = (Arc<RwLock<ServerState>>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&state))
}

/// `/api/v1/flash` prefix shared by every orchestrator route
pub(crate) fn api_flash() -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::path("api").and(warp::path("v1")).and(warp::path("flash"))
}

pub(crate) async fn services_of(state: &Arc<RwLock<ServerState>>) -> Arc<LabServices> {
    state.read().await.services.clone()
}

/// JSON body with an explicit status
pub(crate) fn json_reply<T: Serialize>(body: &T, status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

/// `{error}` body with the status of the error's category
pub(crate) fn error_reply(err: &LabError) -> Response {
    json_reply(
        &ErrorResponse {
            error: err.to_string(),
        },
        err.status_code(),
    )
}

/// Turn framework rejections into the same `{error}` surface as handler errors
pub async fn handle_rejection(err: warp::Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, format!("Invalid query: {}", e))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Upload too large".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported content type".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        log::error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };
    Ok(json_reply(&ErrorResponse { error: message }, status.as_u16()))
}
