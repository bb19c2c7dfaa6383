//! Wire types for the JSON API.
//!
//! Every JSON response is either `{success: true, ...payload}` or
//! `{success: false, code, error}`.

use crate::types::*;
use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

// ========== Requests ==========

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoundRequest {
    pub name: String,
    pub mode: RoundMode,
    pub host_name: String,
    #[serde(default)]
    pub allow_guest_download: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoundRequest {
    pub code: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateChangeRequest {
    pub state: RoundState,
}

// ========== Envelopes ==========

/// `{success: true, ...T}`, plus `warnings` when any side effect failed
#[derive(Debug, Clone, Serialize)]
pub struct Success<T> {
    success: bool,
    #[serde(flatten)]
    pub data: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

impl<T> Success<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
            warnings: Vec::new(),
        }
    }
}

impl<T> From<Outcome<T>> for Success<T> {
    fn from(outcome: Outcome<T>) -> Self {
        Self {
            success: true,
            data: outcome.value,
            warnings: outcome.warnings,
        }
    }
}

impl<T: Serialize> IntoResponse for Success<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// `{success: false, code, error}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub success: bool,
    pub code: String,
    pub error: String,
}

impl Failure {
    pub fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.to_string(),
            error: error.into(),
        }
    }
}

// ========== Non-fatal side effects ==========

/// A side effect that failed without failing the operation it belonged to
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A session token was issued but could not be stored
    SessionNotPersisted { reason: String },
    /// A superseded file could not be deleted
    StaleFileRetained { filename: String, reason: String },
    /// The round's upload directory could not be created up front
    UploadDirUnavailable { reason: String },
    /// An export entry was left out because its file could not be read
    ArchiveEntrySkipped { filename: String, reason: String },
}

/// Primary result plus any warnings collected along the way
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<Warning>) -> Self {
        Self { value, warnings }
    }
}

// ========== Responses ==========

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundCreated {
    pub code: JoinCode,
    pub round_id: RoundId,
    pub participant_id: ParticipantId,
    pub host_name: String,
    #[serde(skip)]
    pub token: SessionToken,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundJoined {
    pub code: JoinCode,
    pub round_id: RoundId,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub is_host: bool,
    /// True when an existing session's participant was updated in place
    pub rejoined: bool,
    #[serde(skip)]
    pub token: SessionToken,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub participant_id: ParticipantId,
    pub is_host: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundInfo {
    pub round: Round,
    pub viewer: Option<Viewer>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChanged {
    pub old_state: RoundState,
    pub new_state: RoundState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub filename: String,
    pub original_name: String,
    pub size: u64,
    pub uploaded_by: String,
    pub is_replacement: bool,
    /// Display name of the chain successor (telephone mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<ParticipantId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleReceipt {
    pub filename: String,
    pub original_name: String,
    pub size: u64,
    pub is_replacement: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_flattens_payload() {
        let body = Success::new(StateChanged {
            old_state: RoundState::Waiting,
            new_state: RoundState::Active,
            message: "Round state updated to active".to_string(),
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["oldState"], "waiting");
        assert_eq!(json["newState"], "active");
    }

    #[test]
    fn test_failure_shape() {
        let json = serde_json::to_value(Failure::new("ROUND_NOT_ACTIVE", "nope")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "ROUND_NOT_ACTIVE");
        assert_eq!(json["error"], "nope");
    }

    #[test]
    fn test_token_never_serialized() {
        let created = RoundCreated {
            code: "ABC123".to_string(),
            round_id: "r".to_string(),
            participant_id: "p".to_string(),
            host_name: "Host".to_string(),
            token: "secret-token".to_string(),
        };
        let json = serde_json::to_string(&Success::new(created)).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("warnings"));
    }

    #[test]
    fn test_create_request_defaults_guest_download() {
        let req: CreateRoundRequest =
            serde_json::from_str(r#"{"name":"Jam","mode":"sample","hostName":"H"}"#).unwrap();
        assert!(!req.allow_guest_download);
        assert_eq!(req.mode, RoundMode::Sample);
    }

    #[test]
    fn test_warning_tagging() {
        let json = serde_json::to_value(Warning::StaleFileRetained {
            filename: "old.mp3".to_string(),
            reason: "busy".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "stale_file_retained");
        assert_eq!(json["filename"], "old.mp3");
    }
}
