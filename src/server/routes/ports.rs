//! Port, device catalog and build matrix routes

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use warp::Filter;
use warp::reply::Response;

use super::{api_flash, error_reply, json_reply, services_of, with_server_state};
use crate::errors::LabError;
use crate::models::{
    BuildConfigResponse, DevicesResponse, PatchesResponse, PortDiagnostic, PortsResponse,
};
use crate::server::app::ServerState;
use crate::services::build_matrix::patches_for;

pub fn create_port_routes(
    state: Arc<RwLock<ServerState>>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let ports = api_flash()
        .and(warp::path("ports"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_server_state(state.clone()))
        .and_then(list_ports_handler);

    let devices = api_flash()
        .and(warp::path("devices"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server_state(state.clone()))
        .and_then(list_devices_handler);

    let build_config = api_flash()
        .and(warp::path("build-config"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server_state(state.clone()))
        .and_then(build_config_handler);

    let reload = api_flash()
        .and(warp::path("build-config"))
        .and(warp::path("reload"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_server_state(state.clone()))
        .and_then(reload_handler);

    let patches = api_flash()
        .and(warp::path("patches"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_server_state(state))
        .and_then(patches_handler);

    ports
        .or(devices)
        .unify()
        .or(build_config)
        .unify()
        .or(reload)
        .unify()
        .or(patches)
        .unify()
}

/// `detect=1`, `detect=true` and `detect=yes` enable chip probing
fn flag(query: &HashMap<String, String>, name: &str) -> bool {
    query
        .get(name)
        .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

async fn list_ports_handler(
    query: HashMap<String, String>,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;
    let detect = flag(&query, "detect");
    if detect {
        log::info!("🔍 Listing ports with chip detection");
    }

    let listing = services.registry.list_ports(detect, &snapshot).await;
    let in_container_no_usb = listing.in_container_no_usb();
    if let Some(PortDiagnostic::EnumerationFailed(reason)) = &listing.diagnostic {
        log::warn!("⚠️ Port enumeration failed: {}", reason);
    }
    Ok(json_reply(
        &PortsResponse {
            ports: listing.ports,
            in_container_no_usb,
            diagnostic: listing.diagnostic,
        },
        200,
    ))
}

async fn list_devices_handler(state: Arc<RwLock<ServerState>>) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;
    Ok(json_reply(
        &DevicesResponse {
            devices: services.registry.list_devices(&snapshot),
        },
        200,
    ))
}

async fn build_config_handler(state: Arc<RwLock<ServerState>>) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;
    Ok(json_reply(
        &BuildConfigResponse {
            builds: snapshot.targets().to_vec(),
        },
        200,
    ))
}

async fn reload_handler(state: Arc<RwLock<ServerState>>) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    match services.refresh_matrix().await {
        Ok(snapshot) => Ok(json_reply(
            &BuildConfigResponse {
                builds: snapshot.targets().to_vec(),
            },
            200,
        )),
        Err(e) => {
            log::error!("❌ Catalog reload failed: {:#}", e);
            Ok(error_reply(&LabError::Validation(format!("{:#}", e))))
        }
    }
}

async fn patches_handler(
    query: HashMap<String, String>,
    state: Arc<RwLock<ServerState>>,
) -> Result<Response, warp::Rejection> {
    let services = services_of(&state).await;
    let snapshot = services.snapshot().await;
    let device_id = query.get("device_id").map(|s| s.trim()).filter(|s| !s.is_empty());
    let firmware_id = query.get("firmware_id").map(|s| s.trim()).filter(|s| !s.is_empty());
    let patches = patches_for(&snapshot, services.repo_root(), device_id, firmware_id);
    Ok(json_reply(&PatchesResponse { patches }, 200))
}
