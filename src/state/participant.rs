use super::AppState;
use crate::error::{RejectCode, RoundError};
use crate::protocol::{JoinRoundRequest, Outcome, RoundJoined};
use crate::types::*;
use chrono::Utc;
use rand::Rng;

pub const JOIN_CODE_LEN: usize = 6;
const JOIN_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Six uppercase alphanumerics from the thread-local CSPRNG
pub fn generate_join_code() -> JoinCode {
    let mut rng = rand::rng();
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_CHARSET[rng.random_range(0..JOIN_CODE_CHARSET.len())] as char)
        .collect()
}

/// Trim a user-supplied name and enforce the length cap
pub(crate) fn clean_display_name(raw: &str, field: &str) -> Result<String, RoundError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(RoundError::BadRequest(format!("{field} is required")));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(RoundError::BadRequest(format!(
            "{field} must be at most {MAX_DISPLAY_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

impl AppState {
    /// Join a waiting round.
    ///
    /// A caller whose session already belongs to this round keeps their
    /// participant id and only has the display name updated. Every call
    /// issues a fresh session token.
    pub async fn join_round(
        &self,
        req: JoinRoundRequest,
        existing: Option<&Session>,
    ) -> Result<Outcome<RoundJoined>, RoundError> {
        let code = normalize_code(&req.code);
        if code.is_empty() {
            return Err(RoundError::BadRequest("Join code is required".to_string()));
        }
        let display_name = clean_display_name(&req.display_name, "Display name")?;

        let guard = self.lock_round(&code).await;
        let deadline = self.deadline();
        let mut round = self.load_round(&code, deadline).await?;

        if round.state != RoundState::Waiting {
            return Err(RoundError::rejected(
                RejectCode::RoundNotWaiting,
                "This round is no longer accepting new participants",
            ));
        }

        let returning = existing.filter(|s| s.belongs_to(&code));
        let (participant_id, rejoined) = match returning {
            Some(session) => {
                let id = session.participant_id.clone();
                match round.participants.get_mut(&id) {
                    Some(participant) => participant.display_name = display_name.clone(),
                    None => {
                        tracing::warn!(
                            round = %code,
                            participant_id = %id,
                            "Session participant missing from round, re-adding"
                        );
                        let is_host = round.is_host(&id);
                        round.participants.insert(
                            id.clone(),
                            Participant {
                                id: id.clone(),
                                display_name: display_name.clone(),
                                is_host,
                                joined_at: Utc::now(),
                            },
                        );
                    }
                }
                (id, true)
            }
            None => {
                let id = ulid::Ulid::new().to_string();
                round.participants.insert(
                    id.clone(),
                    Participant {
                        id: id.clone(),
                        display_name: display_name.clone(),
                        is_host: false,
                        joined_at: Utc::now(),
                    },
                );
                (id, false)
            }
        };

        self.rounds.save(&round, deadline).await?;
        drop(guard);

        tracing::info!(
            round = %code,
            participant_id = %participant_id,
            display_name = %display_name,
            rejoined,
            "Participant joined"
        );

        let (token, warning) = self.issue_session(&participant_id, &code, deadline).await;

        Ok(Outcome::with_warnings(
            RoundJoined {
                code,
                round_id: round.id.clone(),
                is_host: round.is_host(&participant_id),
                participant_id,
                display_name,
                rejoined,
                token,
            },
            warning.into_iter().collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::CreateRoundRequest;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    async fn setup() -> (AppState, tempfile::TempDir, JoinCode, Session) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            upload_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let state = AppState::new(Arc::new(MemoryStore::new()), config);
        let created = state
            .create_round(CreateRoundRequest {
                name: "Jam".to_string(),
                mode: RoundMode::Sample,
                host_name: "Host".to_string(),
                allow_guest_download: false,
            })
            .await
            .unwrap()
            .value;
        let host = state.resolve_session(Some(&created.token)).await.unwrap();
        (state, dir, created.code, host)
    }

    fn join(code: &str, name: &str) -> JoinRoundRequest {
        JoinRoundRequest {
            code: code.to_string(),
            display_name: name.to_string(),
        }
    }

    #[test]
    fn test_join_code_shape() {
        for _ in 0..100 {
            let code = generate_join_code();
            assert_eq!(code.len(), JOIN_CODE_LEN);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_display_name_validation() {
        assert_eq!(clean_display_name("  Ann ", "Display name").unwrap(), "Ann");
        assert!(clean_display_name("   ", "Display name").is_err());
        assert!(clean_display_name(&"x".repeat(65), "Display name").is_err());
        assert!(clean_display_name(&"é".repeat(64), "Display name").is_ok());
    }

    #[tokio::test]
    async fn test_join_normalises_code_and_adds_participant() {
        let (state, _dir, code, _) = setup().await;
        let lower = format!("  {}  ", code.to_lowercase());

        let joined = state.join_round(join(&lower, "Ann"), None).await.unwrap().value;
        assert_eq!(joined.code, code);
        assert!(!joined.is_host);
        assert!(!joined.rejoined);

        let round = state.load_round(&code, state.deadline()).await.unwrap();
        assert_eq!(round.participants.len(), 2);
        assert_eq!(round.display_name(&joined.participant_id), Some("Ann"));
    }

    #[tokio::test]
    async fn test_rejoin_updates_name_in_place() {
        let (state, _dir, code, _) = setup().await;
        let first = state.join_round(join(&code, "Ann"), None).await.unwrap().value;
        let session = state.resolve_session(Some(&first.token)).await.unwrap();

        let second = state
            .join_round(join(&code, "Annie"), Some(&session))
            .await
            .unwrap()
            .value;
        assert!(second.rejoined);
        assert_eq!(second.participant_id, first.participant_id);
        assert_ne!(second.token, first.token);

        let round = state.load_round(&code, state.deadline()).await.unwrap();
        assert_eq!(round.participants.len(), 2);
        assert_eq!(round.display_name(&first.participant_id), Some("Annie"));
    }

    #[tokio::test]
    async fn test_session_for_other_round_is_new_participant() {
        let (state, _dir, code, _) = setup().await;
        let foreign = Session {
            token: generate_join_code(),
            participant_id: "someone".to_string(),
            round_code: "OTHER1".to_string(),
            created_at: Utc::now(),
        };
        let joined = state
            .join_round(join(&code, "Ann"), Some(&foreign))
            .await
            .unwrap()
            .value;
        assert!(!joined.rejoined);
        assert_ne!(joined.participant_id, "someone");
    }

    #[tokio::test]
    async fn test_join_unknown_code_is_not_found() {
        let (state, _dir, _, _) = setup().await;
        let err = state.join_round(join("ZZZZZZ", "Ann"), None).await.unwrap_err();
        assert!(matches!(err, RoundError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_join_rejected_once_round_started() {
        let (state, _dir, code, host) = setup().await;
        state
            .transition_state(&code, Some(&host), RoundState::Active)
            .await
            .unwrap();

        let err = state.join_round(join(&code, "Late"), None).await.unwrap_err();
        assert_eq!(err.code(), "ROUND_NOT_WAITING");
        assert_eq!(err.status(), axum::http::StatusCode::OK);
    }
}
