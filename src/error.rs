//! Error taxonomy for round operations and its mapping onto HTTP responses.
//!
//! State conflicts (joining a running round, uploading before the round
//! starts) are expected outcomes, so they travel as `Rejected` and render as
//! `success: false` with a 200 status. Everything else maps onto a status code.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::Failure;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the key-value substrate
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call exceeded its deadline ({0:?} budget)")]
    Timeout(Duration),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filesystem errors, always carrying the path involved
#[derive(Debug, thiserror::Error)]
#[error("{action} {path}: {source}")]
pub struct FileError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl FileError {
    pub fn new(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.source.kind() == std::io::ErrorKind::NotFound
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("zip write failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("zip write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable reason codes for `success: false` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    RoundNotWaiting,
    RoundNotActive,
    SampleMissing,
    SampleLocked,
    WrongMode,
    InvalidTransition,
    UnsupportedFileType,
    FileTooLarge,
    NoFile,
}

impl RejectCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectCode::RoundNotWaiting => "ROUND_NOT_WAITING",
            RejectCode::RoundNotActive => "ROUND_NOT_ACTIVE",
            RejectCode::SampleMissing => "SAMPLE_MISSING",
            RejectCode::SampleLocked => "SAMPLE_LOCKED",
            RejectCode::WrongMode => "WRONG_MODE",
            RejectCode::InvalidTransition => "INVALID_TRANSITION",
            RejectCode::UnsupportedFileType => "UNSUPPORTED_FILE_TYPE",
            RejectCode::FileTooLarge => "FILE_TOO_LARGE",
            RejectCode::NoFile => "NO_FILE",
        }
    }
}

/// A normal "can't do that right now" outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: RejectCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("You are not a participant in this round")]
    NotParticipant,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// State conflict: rendered as `success: false` with 200
    #[error("{0}")]
    Rejected(Rejection),

    /// Client validation failure on an upload: `success: false` with 400
    #[error("{0}")]
    Invalid(Rejection),

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The store save failed and removing the freshly written file failed too
    #[error("store save failed ({save}) and rollback of {filename} failed ({rollback})")]
    RollbackFailed {
        filename: String,
        save: StoreError,
        rollback: FileError,
    },

    #[error("could not allocate a free join code after {0} attempts")]
    JoinCodeExhausted(usize),
}

impl RoundError {
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        RoundError::Rejected(Rejection::new(code, message))
    }

    pub fn invalid(code: RejectCode, message: impl Into<String>) -> Self {
        RoundError::Invalid(Rejection::new(code, message))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RoundError::BadRequest(_) | RoundError::Invalid(_) => StatusCode::BAD_REQUEST,
            RoundError::Unauthorized | RoundError::NotParticipant => StatusCode::UNAUTHORIZED,
            RoundError::Forbidden(_) => StatusCode::FORBIDDEN,
            RoundError::NotFound(_) => StatusCode::NOT_FOUND,
            RoundError::Rejected(_) => StatusCode::OK,
            RoundError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RoundError::Store(_)
            | RoundError::File(_)
            | RoundError::Archive(_)
            | RoundError::RollbackFailed { .. }
            | RoundError::JoinCodeExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RoundError::BadRequest(_) => "BAD_REQUEST",
            RoundError::Unauthorized => "UNAUTHORIZED",
            RoundError::NotParticipant => "NOT_PARTICIPANT",
            RoundError::Forbidden(_) => "FORBIDDEN",
            RoundError::NotFound(_) => "NOT_FOUND",
            RoundError::Rejected(r) | RoundError::Invalid(r) => r.code.as_str(),
            RoundError::RateLimited { .. } => "RATE_LIMITED",
            RoundError::Store(_) => "STORE_ERROR",
            RoundError::File(_) => "FILE_ERROR",
            RoundError::Archive(_) => "ARCHIVE_ERROR",
            RoundError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            RoundError::JoinCodeExhausted(_) => "JOIN_CODE_EXHAUSTED",
        }
    }

    /// Message shown to the client. Internal errors are not echoed verbatim.
    fn public_message(&self) -> String {
        match self {
            RoundError::Rejected(r) | RoundError::Invalid(r) => r.message.clone(),
            RoundError::Store(_) => "Storage is unavailable, please retry".to_string(),
            RoundError::File(_) | RoundError::RollbackFailed { .. } => {
                "Failed to save file".to_string()
            }
            RoundError::Archive(_) => "Failed to create export archive".to_string(),
            RoundError::JoinCodeExhausted(_) => "Failed to create round".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RoundError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }

        let body = Json(Failure::new(self.code(), self.public_message()));
        match self {
            RoundError::RateLimited { retry_after } => (
                status,
                [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RoundError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(RoundError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RoundError::NotParticipant.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            RoundError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            RoundError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RoundError::rejected(RejectCode::RoundNotActive, "x").status(),
            StatusCode::OK
        );
        assert_eq!(
            RoundError::invalid(RejectCode::FileTooLarge, "x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RoundError::Store(StoreError::Unavailable("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rejection_code_passthrough() {
        let err = RoundError::rejected(RejectCode::SampleMissing, "no sample");
        assert_eq!(err.code(), "SAMPLE_MISSING");
        assert_eq!(err.public_message(), "no sample");
    }

    #[test]
    fn test_internal_errors_are_not_echoed() {
        let err = RoundError::Store(StoreError::Unavailable("redis://secret-host".into()));
        assert!(!err.public_message().contains("secret-host"));
    }
}
