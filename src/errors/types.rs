//! Error taxonomy for orchestrator operations

use serde::Serialize;
use thiserror::Error;

/// Coarse error category, used for HTTP status mapping and caller decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or conflicting input; never reached hardware or a build tool
    Validation,
    /// Port busy, or no USB passthrough in a container
    ResourceUnavailable,
    /// Build or flashing tool reported failure
    ExecutionFailure,
    /// Wall-clock bound exceeded, process terminated
    Timeout,
    /// I/O failure while talking to the device
    TransferError,
    /// Malformed streamed record
    ProtocolError,
    /// Caller stopped the operation
    Cancelled,
}

/// Main error type for labflash operations
#[derive(Debug, Error)]
pub enum LabError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing target: {0} required")]
    MissingTarget(&'static str),

    #[error("Patch {patch} failed to apply: {detail}")]
    PatchConflict { patch: String, detail: String },

    #[error("Port {port} is busy or in use by another operation")]
    PortBusy { port: String },

    #[error("No USB passthrough available: {0}")]
    NoUsbPassthrough(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Device mismatch: {0}")]
    DeviceMismatch(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl LabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::Validation(_)
            | LabError::MissingTarget(_)
            | LabError::Serialization(_) => ErrorKind::Validation,
            LabError::PortBusy { .. } | LabError::NoUsbPassthrough(_) => {
                ErrorKind::ResourceUnavailable
            }
            LabError::Execution(_)
            | LabError::PatchConflict { .. }
            | LabError::Io(_)
            | LabError::Http(_) => ErrorKind::ExecutionFailure,
            LabError::Timeout { .. } => ErrorKind::Timeout,
            LabError::Transfer(_) | LabError::DeviceMismatch(_) => ErrorKind::TransferError,
            LabError::Protocol(_) => ErrorKind::ProtocolError,
            LabError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// HTTP status code for the error surface exposed by the server
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::ResourceUnavailable => 409,
            ErrorKind::Timeout => 504,
            ErrorKind::Cancelled => 499,
            _ => 500,
        }
    }

    /// Whether the failure happened before any side effect
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        LabError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for LabError {
    fn from(err: reqwest::Error) -> Self {
        LabError::Http(err.to_string())
    }
}

/// Result type alias for labflash operations
pub type Result<T> = std::result::Result<T, LabError>;
