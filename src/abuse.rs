//! Request throttling for the mutating routes.
//!
//! Fixed-window counters. A caller is identified by the session their cookie
//! resolves to, or by peer address when there is none. A cookie that doesn't
//! resolve counts as no cookie, so rotating junk values buys nothing.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response},
    middleware::Next,
    response::IntoResponse,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::auth::{session_token, CurrentSession};
use crate::config::RateLimitConfig;
use crate::error::RoundError;
use crate::state::AppState;
use crate::types::Session;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    used: u32,
}

/// Per-caller request counters
#[derive(Debug, Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Window>>>,
    max_requests: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self::new(defaults.max_requests, defaults.window)
    }
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    /// `None` when throttling is switched off
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.max_requests, config.window))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request for `key`. When the budget is spent, returns how
    /// long until the key's window reopens.
    pub async fn acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let window = windows.entry(key.to_string()).or_insert(Window {
            opened: now,
            used: 0,
        });

        let elapsed = now.duration_since(window.opened);
        if elapsed >= self.window {
            *window = Window {
                opened: now,
                used: 0,
            };
        } else if window.used >= self.max_requests {
            return Err(self.window - elapsed);
        }

        window.used += 1;
        Ok(())
    }

    /// Drop counters whose window closed at least one full window ago
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.opened) < self.window * 2);
        before - windows.len()
    }

    pub async fn tracked(&self) -> usize {
        self.windows.read().await.len()
    }
}

/// Periodically prune the limiter's table
pub fn spawn_cleanup(limiter: RateLimiter) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(limiter.window() * 6);
        loop {
            interval.tick().await;
            let removed = limiter.cleanup().await;
            if removed > 0 {
                tracing::debug!(removed, "Pruned rate limiter entries");
            }
        }
    })
}

/// Middleware state: the limiter plus access to the session store
#[derive(Clone)]
pub struct Throttle {
    pub limiter: RateLimiter,
    pub state: Arc<AppState>,
}

/// Counter key for a caller. `None` when there is nothing to key on
/// (no live session and no peer address).
pub fn throttle_key(session: Option<&Session>, peer: Option<SocketAddr>) -> Option<String> {
    match (session, peer) {
        (Some(session), _) => Some(format!(
            "participant:{}:{}",
            session.round_code, session.participant_id
        )),
        (None, Some(peer)) => Some(format!("peer:{}", peer.ip())),
        (None, None) => None,
    }
}

/// Throttle mutating requests.
///
/// The resolved session is stashed in the request extensions so the
/// handler's `CurrentSession` doesn't look it up a second time.
pub async fn rate_limit_middleware(
    State(throttle): State<Throttle>,
    mut request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let token = session_token(request.headers());
    let session = throttle.state.resolve_session(token.as_deref()).await;
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    match throttle_key(session.as_ref(), peer) {
        Some(key) => {
            if let Err(retry_after) = throttle.limiter.acquire(&key).await {
                tracing::warn!(path = %request.uri().path(), key = %key, "Rate limited");
                return RoundError::RateLimited { retry_after }.into_response();
            }
        }
        None => tracing::debug!("No session or peer address, request not throttled"),
    }

    request.extensions_mut().insert(CurrentSession(session));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(round: &str, participant: &str) -> Session {
        Session {
            token: "t".repeat(64),
            participant_id: participant.to_string(),
            round_code: round.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_budget_spent_reports_remaining_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(30));
        for _ in 0..3 {
            assert!(limiter.acquire("peer:10.0.0.1").await.is_ok());
        }

        let retry_after = limiter.acquire("peer:10.0.0.1").await.unwrap_err();
        assert!(retry_after <= Duration::from_secs(30));
        assert!(retry_after > Duration::from_secs(29));

        // Someone else is unaffected
        assert!(limiter.acquire("peer:10.0.0.2").await.is_ok());
    }

    #[tokio::test]
    async fn test_window_reopens() {
        let limiter = RateLimiter::new(1, Duration::from_millis(40));
        assert!(limiter.acquire("k").await.is_ok());
        assert!(limiter.acquire("k").await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.acquire("k").await.is_ok());
        assert!(limiter.acquire("k").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_drops_stale_windows() {
        let limiter = RateLimiter::new(2, Duration::from_millis(10));
        limiter.acquire("old").await.ok();
        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.acquire("fresh").await.ok();

        assert_eq!(limiter.cleanup().await, 1);
        assert_eq!(limiter.tracked().await, 1);
    }

    #[test]
    fn test_throttle_key_prefers_session() {
        let peer: SocketAddr = "192.0.2.7:5123".parse().unwrap();
        let host = session("ABC123", "p1");

        assert_eq!(
            throttle_key(Some(&host), Some(peer)).as_deref(),
            Some("participant:ABC123:p1")
        );
        assert_eq!(
            throttle_key(None, Some(peer)).as_deref(),
            Some("peer:192.0.2.7")
        );
        // Source port doesn't matter
        let other_port: SocketAddr = "192.0.2.7:6000".parse().unwrap();
        assert_eq!(
            throttle_key(None, Some(other_port)),
            throttle_key(None, Some(peer))
        );
        assert_eq!(throttle_key(None, None), None);
    }

    #[test]
    fn test_disabled_config_has_no_limiter() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        assert!(RateLimiter::from_config(&config).is_none());
        assert!(RateLimiter::from_config(&RateLimitConfig::default()).is_some());
    }
}
