//! Serial port enumeration models

use serde::{Deserialize, Serialize};

/// A serial port seen during one enumeration pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub port: String,
    pub description: String,
    /// Normalised chip id (e.g. "esp32s3") when detection ran and succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chip: Option<String>,
    /// Probe failure text when detection ran but found no chip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_error: Option<String>,
    #[serde(default)]
    pub suggested_device_ids: Vec<String>,
}

impl Port {
    pub fn new(port: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            description: description.into(),
            chip: None,
            detection_error: None,
            suggested_device_ids: Vec::new(),
        }
    }
}

/// Why a listing came back empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PortDiagnostic {
    /// Detection ran on real hardware and nothing was attached
    NoPorts,
    /// Running inside a container without USB passthrough
    ContainerNoUsb,
    /// The platform enumeration call itself failed
    EnumerationFailed(String),
}

/// Result of `list_ports`; never an error, at worst empty with a diagnostic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortListing {
    pub ports: Vec<Port>,
    pub diagnostic: Option<PortDiagnostic>,
}

impl PortListing {
    pub fn in_container_no_usb(&self) -> bool {
        matches!(self.diagnostic, Some(PortDiagnostic::ContainerNoUsb))
    }
}

/// Outcome of first-match device auto-detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "selection", rename_all = "snake_case")]
pub enum Selection {
    /// No port carried any suggestion
    Nothing,
    /// Exactly one port had suggestions
    Detected { port: String, device_id: String },
    /// Several ports had suggestions; the first is still chosen
    Ambiguous {
        port: String,
        device_id: String,
        candidates: Vec<String>,
    },
}

impl Selection {
    /// The chosen (port, device id), if any
    pub fn chosen(&self) -> Option<(&str, &str)> {
        match self {
            Selection::Nothing => None,
            Selection::Detected { port, device_id }
            | Selection::Ambiguous {
                port, device_id, ..
            } => Some((port.as_str(), device_id.as_str())),
        }
    }
}
