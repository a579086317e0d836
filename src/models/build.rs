//! Build request and outcome models

use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use crate::errors::LabError;

pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 300;
pub const MIN_BUILD_TIMEOUT_SECS: u64 = 60;
pub const MAX_BUILD_TIMEOUT_SECS: u64 = 3600;

/// Resolve a requested build timeout: absent or below the minimum falls back
/// to the default, above the maximum is clamped.
pub fn resolve_timeout(requested: Option<u64>) -> u64 {
    match requested {
        None => DEFAULT_BUILD_TIMEOUT_SECS,
        Some(t) if t < MIN_BUILD_TIMEOUT_SECS => DEFAULT_BUILD_TIMEOUT_SECS,
        Some(t) => t.min(MAX_BUILD_TIMEOUT_SECS),
    }
}

/// Build submission, as accepted by `POST /api/v1/flash/build`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    pub device_id: String,
    pub firmware_id: String,
    #[serde(default)]
    pub env_name: String,
    #[serde(default)]
    pub patch_paths: Vec<String>,
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub flash_after: bool,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub flash_device_id: Option<String>,
}

impl BuildRequest {
    pub fn new(
        device_id: impl Into<String>,
        firmware_id: impl Into<String>,
        env_name: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            firmware_id: firmware_id.into(),
            env_name: env_name.into(),
            ..Default::default()
        }
    }

    /// Chain a flash of the produced artifact onto this build
    pub fn with_flash(mut self, port: impl Into<String>, device_id: impl Into<String>) -> Self {
        self.flash_after = true;
        self.port = Some(port.into());
        self.flash_device_id = Some(device_id.into());
        self
    }
}

/// Observable build lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::Failed | BuildState::TimedOut
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: BuildState) -> bool {
        matches!(
            (self, next),
            (BuildState::Pending, BuildState::Running)
                | (BuildState::Running, BuildState::Succeeded)
                | (BuildState::Running, BuildState::Failed)
                | (BuildState::Running, BuildState::TimedOut)
        )
    }
}

/// What happened to the flash chained after a successful build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlashFollowUp {
    NotRequested,
    Flashed { message: String },
    Failed { error: String },
}

/// Terminal result of one build submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded {
        artifact: Artifact,
        flash: FlashFollowUp,
    },
    Failed {
        error: String,
    },
    TimedOut {
        seconds: u64,
    },
}

impl BuildOutcome {
    pub fn state(&self) -> BuildState {
        match self {
            BuildOutcome::Succeeded { .. } => BuildState::Succeeded,
            BuildOutcome::Failed { .. } => BuildState::Failed,
            BuildOutcome::TimedOut { .. } => BuildState::TimedOut,
        }
    }

    /// The error a failed or timed-out build ends with
    pub fn error(&self) -> Option<LabError> {
        match self {
            BuildOutcome::Succeeded { .. } => None,
            BuildOutcome::Failed { error } => Some(LabError::Execution(error.clone())),
            BuildOutcome::TimedOut { seconds } => Some(LabError::Timeout { seconds: *seconds }),
        }
    }

    /// Flatten into the wire result shape
    pub fn to_result(&self) -> BuildResult {
        match self {
            BuildOutcome::Succeeded { artifact, flash } => {
                let (flashed, flash_error) = match flash {
                    FlashFollowUp::NotRequested => (false, None),
                    FlashFollowUp::Flashed { .. } => (true, None),
                    FlashFollowUp::Failed { error } => (false, Some(error.clone())),
                };
                BuildResult {
                    success: true,
                    state: Some(BuildState::Succeeded),
                    path: Some(artifact.path.clone()),
                    flashed: Some(flashed),
                    flash_error,
                    error: None,
                }
            }
            BuildOutcome::Failed { error } => BuildResult {
                state: Some(BuildState::Failed),
                ..BuildResult::failure(error.clone())
            },
            BuildOutcome::TimedOut { seconds } => BuildResult {
                state: Some(BuildState::TimedOut),
                ..BuildResult::failure(LabError::Timeout { seconds: *seconds }.to_string())
            },
        }
    }
}

/// Wire shape of a build result
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    /// Terminal state; absent when the request was rejected before running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BuildState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flashed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn timed_out(&self) -> bool {
        self.state == Some(BuildState::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::artifact::ArtifactKind;

    fn artifact() -> Artifact {
        Artifact {
            path: "artifacts/t_beam_1w/meshtastic/build_tbeam-1w_20250101_120000/firmware.bin"
                .to_string(),
            name: "firmware.bin".to_string(),
            kind: ArtifactKind::Artifact,
            device: Some("t_beam_1w".to_string()),
            firmware: Some("meshtastic".to_string()),
            size: 1024,
        }
    }

    #[test]
    fn test_resolve_timeout_bounds() {
        assert_eq!(resolve_timeout(None), 300);
        assert_eq!(resolve_timeout(Some(0)), 300);
        assert_eq!(resolve_timeout(Some(59)), 300);
        assert_eq!(resolve_timeout(Some(60)), 60);
        assert_eq!(resolve_timeout(Some(3600)), 3600);
        assert_eq!(resolve_timeout(Some(86_400)), 3600);
    }

    #[test]
    fn test_transitions() {
        assert!(BuildState::Pending.can_transition_to(BuildState::Running));
        assert!(BuildState::Running.can_transition_to(BuildState::TimedOut));
        assert!(!BuildState::Pending.can_transition_to(BuildState::Succeeded));
        assert!(!BuildState::Failed.can_transition_to(BuildState::Running));
        assert!(BuildState::TimedOut.is_terminal());
    }

    #[test]
    fn test_flash_failure_keeps_build_success() {
        let outcome = BuildOutcome::Succeeded {
            artifact: artifact(),
            flash: FlashFollowUp::Failed {
                error: "Port /dev/ttyACM0 is busy".to_string(),
            },
        };
        let result = outcome.to_result();
        assert!(result.success);
        assert_eq!(result.flashed, Some(false));
        assert!(result.flash_error.unwrap().contains("busy"));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_timed_out_is_distinct_from_failed() {
        let timed_out = BuildOutcome::TimedOut { seconds: 120 };
        assert_eq!(timed_out.state(), BuildState::TimedOut);
        assert_eq!(timed_out.error().unwrap().status_code(), 504);
        let result = timed_out.to_result();
        assert!(!result.success);
        assert!(result.timed_out());
        assert_eq!(result.state, Some(BuildState::TimedOut));

        let failed = BuildOutcome::Failed {
            error: "Timed out after 120s".to_string(),
        };
        assert!(!failed.to_result().timed_out());
        assert_eq!(failed.to_result().state, Some(BuildState::Failed));
        assert_eq!(failed.error().unwrap().status_code(), 500);
    }

    #[test]
    fn test_result_state_on_the_wire() {
        let json = serde_json::to_value(BuildOutcome::TimedOut { seconds: 60 }.to_result()).unwrap();
        assert_eq!(json["state"], "timed_out");
        let back: BuildResult = serde_json::from_value(json).unwrap();
        assert!(back.timed_out());
        assert!(serde_json::to_value(BuildResult::failure("bad env")).unwrap().get("state").is_none());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: BuildRequest = serde_json::from_str(
            r#"{"device_id":"t_beam_1w","firmware_id":"meshtastic","env_name":"tbeam"}"#,
        )
        .unwrap();
        assert!(req.patch_paths.is_empty());
        assert!(!req.flash_after);
        assert_eq!(req.timeout, None);
    }
}
