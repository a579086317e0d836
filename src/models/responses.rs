//! API request/response bodies

use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::device::{BuildTarget, DeviceProfile, Patch};
use super::port::{Port, PortDiagnostic};

/// `GET /api/v1/flash/ports`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsResponse {
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub in_container_no_usb: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<PortDiagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfigResponse {
    pub builds: Vec<BuildTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchesResponse {
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsResponse {
    pub files: Vec<Artifact>,
}

/// `{success, message|error}` shape used by flash and restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Plain `{error}` body for endpoints without a `success` field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadReleaseRequest {
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub firmware_id: Option<String>,
    #[serde(default)]
    pub asset_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadReleaseResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub hostname: String,
}
