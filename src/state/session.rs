use super::AppState;
use crate::protocol::Warning;
use crate::store::Deadline;
use crate::types::*;
use chrono::Utc;
use rand::Rng;

const TOKEN_BYTES: usize = 32;

/// Opaque bearer token: 32 random bytes, hex encoded
pub fn generate_token() -> SessionToken {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn looks_like_token(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

impl AppState {
    /// Resolve a presented token to its session.
    ///
    /// Missing, malformed or expired tokens yield `None`, and so does a store
    /// failure (logged). This never errors.
    pub async fn resolve_session(&self, token: Option<&str>) -> Option<Session> {
        let token = token?.trim();
        if !looks_like_token(token) {
            return None;
        }

        match self.sessions.load(token, self.deadline()).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Session lookup failed, treating caller as anonymous");
                None
            }
        }
    }

    /// Mint and persist a fresh session. A failed save still returns the
    /// token, together with a warning.
    pub(crate) async fn issue_session(
        &self,
        participant_id: &str,
        round_code: &str,
        deadline: Deadline,
    ) -> (SessionToken, Option<Warning>) {
        let session = Session {
            token: generate_token(),
            participant_id: participant_id.to_string(),
            round_code: round_code.to_string(),
            created_at: Utc::now(),
        };

        match self.sessions.save(&session, deadline).await {
            Ok(()) => {
                tracing::debug!(round = round_code, participant_id, "Session issued");
                (session.token, None)
            }
            Err(e) => {
                tracing::warn!(
                    round = round_code,
                    participant_id,
                    error = %e,
                    "Failed to persist session"
                );
                (
                    session.token,
                    Some(Warning::SessionNotPersisted {
                        reason: e.to_string(),
                    }),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(Arc::new(MemoryStore::new()), AppConfig::default())
    }

    #[test]
    fn test_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(looks_like_token(&a));
    }

    #[tokio::test]
    async fn test_issue_then_resolve() {
        let state = state();
        let (token, warning) = state.issue_session("p1", "ABC123", state.deadline()).await;
        assert!(warning.is_none());

        let session = state.resolve_session(Some(&token)).await.unwrap();
        assert_eq!(session.participant_id, "p1");
        assert!(session.belongs_to("ABC123"));
    }

    #[tokio::test]
    async fn test_resolve_garbage_is_none() {
        let state = state();
        assert!(state.resolve_session(None).await.is_none());
        assert!(state.resolve_session(Some("")).await.is_none());
        assert!(state.resolve_session(Some("not-a-token")).await.is_none());
        assert!(state.resolve_session(Some(&generate_token())).await.is_none());
    }

    #[tokio::test]
    async fn test_every_issue_mints_new_token() {
        let state = state();
        let (first, _) = state.issue_session("p1", "ABC123", state.deadline()).await;
        let (second, _) = state.issue_session("p1", "ABC123", state.deadline()).await;
        assert_ne!(first, second);
        // The earlier token stays valid until it expires
        assert!(state.resolve_session(Some(&first)).await.is_some());
    }
}
