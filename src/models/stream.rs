//! Streamed response records (`data: {json}` lines)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::build::BuildResult;
use crate::errors::LabError;

/// One decoded data record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_bom: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_design: Option<Value>,
    /// Build result carried by the terminal record of a streamed build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BuildResult>,
    /// Server-side failure reported in-band
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamRecord {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn done_with_result(result: BuildResult) -> Self {
        Self {
            done: true,
            result: Some(result),
            ..Default::default()
        }
    }

    /// Encode as one protocol line pair (`data: {...}\n\n`)
    pub fn to_line(&self) -> String {
        // Serialization of this struct cannot fail: all fields are plain data
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }

    /// Structured payload of a terminal record, if it carries any
    pub fn terminal_payload(&self) -> Option<TerminalPayload> {
        let payload = TerminalPayload {
            items: self.items.clone(),
            suggested_bom: self.suggested_bom.clone(),
            suggested_design: self.suggested_design.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
        };
        if payload.is_empty() { None } else { Some(payload) }
    }
}

/// Authoritative final value of a stream, delivered once
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalPayload {
    pub items: Option<Value>,
    pub suggested_bom: Option<Value>,
    pub suggested_design: Option<Value>,
    pub result: Option<BuildResult>,
    pub error: Option<String>,
}

impl TerminalPayload {
    pub fn is_empty(&self) -> bool {
        self.items.is_none()
            && self.suggested_bom.is_none()
            && self.suggested_design.is_none()
            && self.result.is_none()
            && self.error.is_none()
    }
}

/// Event surfaced by the decoder while bytes arrive
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done(Option<TerminalPayload>),
}

/// How a drained stream ended
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// A `done` record was received
    Complete {
        text: String,
        terminal: Option<TerminalPayload>,
        malformed: usize,
    },
    /// Transport failed or the stream ended without `done`; text is partial
    Incomplete {
        text: String,
        error: String,
        malformed: usize,
    },
    /// Non-2xx initial response
    Rejected { status: u16, error: String },
}

impl RelayOutcome {
    pub fn text(&self) -> &str {
        match self {
            RelayOutcome::Complete { text, .. } | RelayOutcome::Incomplete { text, .. } => text,
            RelayOutcome::Rejected { .. } => "",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, RelayOutcome::Complete { .. })
    }

    /// The build result of a streamed build. A stream that breaks off, or
    /// completes without a result, is a protocol error.
    pub fn into_build_result(self) -> Result<BuildResult, LabError> {
        match self {
            RelayOutcome::Complete { terminal, malformed, .. } => {
                terminal.and_then(|t| t.result).ok_or_else(|| {
                    LabError::Protocol(with_malformed("Stream completed without a build result", malformed))
                })
            }
            RelayOutcome::Incomplete { error, malformed, .. } => {
                Err(LabError::Protocol(with_malformed(&error, malformed)))
            }
            RelayOutcome::Rejected { status, error } => Err(LabError::Http(format!("HTTP {}: {}", status, error))),
        }
    }
}

fn with_malformed(message: &str, malformed: usize) -> String {
    if malformed == 0 {
        message.to_string()
    } else {
        format!("{} ({} malformed record(s) skipped)", message, malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_build_result_from_outcome() {
        let complete = RelayOutcome::Complete {
            text: "Linking\n".to_string(),
            terminal: Some(TerminalPayload {
                result: Some(BuildResult::failure("exit 1")),
                ..Default::default()
            }),
            malformed: 0,
        };
        assert_eq!(complete.into_build_result().unwrap().error.as_deref(), Some("exit 1"));

        let no_result = RelayOutcome::Complete {
            text: String::new(),
            terminal: None,
            malformed: 2,
        };
        let err = no_result.into_build_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(err.to_string().contains("2 malformed"));

        let cut = RelayOutcome::Incomplete {
            text: "Compil".to_string(),
            error: "Stream ended before completion".to_string(),
            malformed: 0,
        };
        assert_eq!(cut.into_build_result().unwrap_err().kind(), ErrorKind::ProtocolError);

        let rejected = RelayOutcome::Rejected {
            status: 400,
            error: "env_name is required".to_string(),
        };
        assert!(rejected.into_build_result().unwrap_err().to_string().contains("env_name"));
    }
}
