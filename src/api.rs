//! HTTP API endpoints.
//!
//! Handlers are thin: extract, call the matching `AppState` operation, and
//! turn the result into JSON (or raw bytes for file endpoints).

use axum::{
    extract::{
        multipart::{Multipart, MultipartError, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Path, State,
    },
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::abuse::{self, RateLimiter, Throttle};
use crate::auth::{session_cookie_header, CurrentSession};
use crate::config::{MAX_UPLOAD_BYTES, MULTIPART_OVERHEAD_BYTES};
use crate::error::{RejectCode, RoundError};
use crate::files::UploadedFile;
use crate::protocol::*;
use crate::state::AppState;
use crate::types::normalize_code;

/// Multipart field carrying a participant upload
pub const AUDIO_FIELD: &str = "audio";
/// Multipart field carrying the host's sample
pub const SAMPLE_FIELD: &str = "sample";

/// Set on export responses when some files had to be left out
pub const EXPORT_SKIPPED_HEADER: &str = "x-export-skipped";

/// Build the full application router.
///
/// `limiter` throttles the mutating routes; pass `None` to disable. Serve
/// with connect info (`into_make_service_with_connect_info::<SocketAddr>`)
/// so anonymous callers are throttled per peer address.
pub fn router(state: Arc<AppState>, limiter: Option<RateLimiter>) -> Router {
    let mutating = Router::new()
        .route("/round/create", post(create_round))
        .route("/round/join", post(join_round))
        .route("/round/{code}/state", post(change_state))
        .route(
            "/round/{code}/upload",
            post(upload).layer(upload_body_limit()),
        )
        .route(
            "/round/{code}/upload-sample",
            post(upload_sample).layer(upload_body_limit()),
        );
    let mutating = match limiter {
        Some(limiter) => mutating.layer(middleware::from_fn_with_state(
            Throttle {
                limiter,
                state: state.clone(),
            },
            abuse::rate_limit_middleware,
        )),
        None => mutating,
    };

    Router::new()
        .route("/health", get(health))
        .route("/round/{code}/info", get(round_info))
        .route("/round/{code}/download/{filename}", get(download))
        .route("/round/{code}/export", get(export))
        .merge(mutating)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn upload_body_limit() -> DefaultBodyLimit {
    DefaultBodyLimit::max(MAX_UPLOAD_BYTES + MULTIPART_OVERHEAD_BYTES)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, RoundError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| RoundError::BadRequest(rejection.body_text()))
}

/// Attach the session cookie for a freshly issued token
fn with_session_cookie(state: &AppState, token: &str, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    match session_cookie_header(token, state.config.session_max_age()) {
        Some(cookie) => {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
        None => tracing::error!("Issued session token is not a valid cookie value"),
    }
    response
}

fn multipart_error(e: MultipartError) -> RoundError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        RoundError::invalid(RejectCode::FileTooLarge, "File too large (max 32MB)")
    } else {
        RoundError::BadRequest(e.body_text())
    }
}

/// Read the named file field; other fields are skipped
async fn read_file_field(
    multipart: Result<Multipart, MultipartRejection>,
    name: &str,
) -> Result<Option<UploadedFile>, RoundError> {
    let mut multipart =
        multipart.map_err(|rejection| RoundError::BadRequest(rejection.body_text()))?;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(name) {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(Some(UploadedFile::new(original_name, bytes)));
    }
    Ok(None)
}

/// `attachment; filename="..."` with anything outside printable ASCII replaced
fn attachment(filename: &str) -> HeaderValue {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn file_response(content_type: HeaderValue, download_name: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, attachment(download_name)),
        ],
        bytes,
    )
        .into_response()
}

/// GET /health
pub async fn health() -> Success<Health> {
    Success::new(Health { status: "ok" })
}

/// POST /round/create
pub async fn create_round(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateRoundRequest>, JsonRejection>,
) -> Result<Response, RoundError> {
    let outcome = state.create_round(json_body(payload)?).await?;
    let token = outcome.value.token.clone();
    Ok(with_session_cookie(&state, &token, Success::from(outcome)))
}

/// POST /round/join
pub async fn join_round(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    payload: Result<Json<JoinRoundRequest>, JsonRejection>,
) -> Result<Response, RoundError> {
    let outcome = state
        .join_round(json_body(payload)?, session.session())
        .await?;
    let token = outcome.value.token.clone();
    Ok(with_session_cookie(&state, &token, Success::from(outcome)))
}

/// GET /round/{code}/info
pub async fn round_info(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    session: CurrentSession,
) -> Result<Success<RoundInfo>, RoundError> {
    let info = state
        .round_info(&normalize_code(&code), session.session())
        .await?;
    Ok(Success::new(info))
}

/// POST /round/{code}/state
pub async fn change_state(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    session: CurrentSession,
    payload: Result<Json<StateChangeRequest>, JsonRejection>,
) -> Result<Success<StateChanged>, RoundError> {
    let req = json_body(payload)?;
    let outcome = state
        .transition_state(&normalize_code(&code), session.session(), req.state)
        .await?;
    Ok(outcome.into())
}

/// POST /round/{code}/upload (multipart field `audio`)
///
/// The body is only read once the caller and round pass the upload checks.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    session: CurrentSession,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Success<UploadReceipt>, RoundError> {
    let code = normalize_code(&code);
    state.check_upload(&code, session.session()).await?;

    let file = read_file_field(multipart, AUDIO_FIELD).await?;
    let outcome = state
        .upload_submission(&code, session.session(), file)
        .await?;
    Ok(outcome.into())
}

/// POST /round/{code}/upload-sample (multipart field `sample`)
pub async fn upload_sample(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    session: CurrentSession,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Success<SampleReceipt>, RoundError> {
    let code = normalize_code(&code);
    state.check_sample_upload(&code, session.session()).await?;

    let file = read_file_field(multipart, SAMPLE_FIELD).await?;
    let outcome = state
        .upload_sample(&code, session.session(), file)
        .await?;
    Ok(outcome.into())
}

/// GET /round/{code}/download/{filename}
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((code, filename)): Path<(String, String)>,
    session: CurrentSession,
) -> Result<Response, RoundError> {
    let file = state
        .download_file(&normalize_code(&code), session.session(), &filename)
        .await?;
    Ok(file_response(
        HeaderValue::from_static(file.content_type),
        &file.download_name,
        file.bytes,
    ))
}

/// GET /round/{code}/export
pub async fn export(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    session: CurrentSession,
) -> Result<Response, RoundError> {
    let outcome = state
        .export_round(&normalize_code(&code), session.session())
        .await?;
    let archive = outcome.value;

    let mut response = file_response(
        HeaderValue::from_static("application/zip"),
        &archive.filename,
        archive.bytes,
    );
    if !outcome.warnings.is_empty() {
        response.headers_mut().insert(
            HeaderName::from_static(EXPORT_SKIPPED_HEADER),
            HeaderValue::from(outcome.warnings.len()),
        );
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_header_is_ascii_safe() {
        assert_eq!(
            attachment("my take.wav").to_str().unwrap(),
            "attachment; filename=\"my take.wav\""
        );
        assert_eq!(
            attachment("a\"b\\ü.mp3").to_str().unwrap(),
            "attachment; filename=\"a_b__.mp3\""
        );
    }
}
