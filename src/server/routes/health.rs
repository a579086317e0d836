//! Health check route

use warp::Filter;
use warp::reply::Response;

use super::json_reply;
use crate::models::HealthResponse;

/// Create health check route
pub fn create_health_route() -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::get())
        .and(warp::path::end())
        .map(|| {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            json_reply(
                &HealthResponse {
                    status: "healthy".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    hostname,
                },
                200,
            )
        })
}
