//! Session cookie handling.
//!
//! The browser holds a single `session` cookie carrying the opaque token.
//! Handlers receive the resolved session through the `CurrentSession`
//! extractor; a missing or stale cookie is simply `None`.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderValue},
};
use std::convert::Infallible;
use std::sync::Arc;

use crate::state::AppState;
use crate::types::Session;

pub const SESSION_COOKIE: &str = "session";

/// Pull the session token out of the request's `Cookie` header(s)
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|token| !token.is_empty())
}

/// `Set-Cookie` value for a freshly issued session
pub fn session_cookie(token: &str, max_age_secs: u64) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; Max-Age={max_age_secs}; HttpOnly; SameSite=Lax")
}

/// Same as [`session_cookie`], as a header value. Tokens are hex, so this
/// only fails on a malformed token.
pub fn session_cookie_header(token: &str, max_age_secs: u64) -> Option<HeaderValue> {
    HeaderValue::from_str(&session_cookie(token, max_age_secs)).ok()
}

/// The caller's session, if the cookie resolves to a live one
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Option<Session>);

impl CurrentSession {
    pub fn session(&self) -> Option<&Session> {
        self.0.as_ref()
    }
}

impl FromRequestParts<Arc<AppState>> for CurrentSession {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // Already resolved by the throttling middleware
        if let Some(current) = parts.extensions.get::<CurrentSession>() {
            return Ok(current.clone());
        }
        let token = session_token(&parts.headers);
        Ok(CurrentSession(state.resolve_session(token.as_deref()).await))
    }
}
