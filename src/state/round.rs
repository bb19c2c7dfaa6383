use super::participant::{clean_display_name, generate_join_code};
use super::AppState;
use crate::error::{RejectCode, RoundError};
use crate::protocol::{
    CreateRoundRequest, Outcome, RoundCreated, RoundInfo, StateChanged, Viewer, Warning,
};
use crate::types::*;
use chrono::Utc;
use std::collections::BTreeMap;

/// Upper bound on join-code collision retries
pub const MAX_JOIN_CODE_ATTEMPTS: usize = 64;

impl AppState {
    /// Create a round with the caller as host and issue the host's session
    pub async fn create_round(
        &self,
        req: CreateRoundRequest,
    ) -> Result<Outcome<RoundCreated>, RoundError> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(RoundError::BadRequest("Round name is required".to_string()));
        }
        let host_name = clean_display_name(&req.host_name, "Host name")?;

        let host_id = ulid::Ulid::new().to_string();
        let now = Utc::now();
        let mut warnings = Vec::new();

        let mut attempt = 0;
        let (round, deadline) = loop {
            attempt += 1;
            if attempt > MAX_JOIN_CODE_ATTEMPTS {
                return Err(RoundError::JoinCodeExhausted(MAX_JOIN_CODE_ATTEMPTS));
            }

            let code = generate_join_code();
            // Held across exists + save so two creators can't claim one code
            let _guard = self.lock_round(&code).await;
            let deadline = self.deadline();
            if self.rounds.exists(&code, deadline).await? {
                tracing::debug!(code = %code, attempt, "Join code collision, retrying");
                continue;
            }

            let round = Round {
                id: ulid::Ulid::new().to_string(),
                name: name.to_string(),
                mode: req.mode,
                join_code: code,
                state: RoundState::Waiting,
                host_id: host_id.clone(),
                participants: BTreeMap::from([(
                    host_id.clone(),
                    Participant {
                        id: host_id.clone(),
                        display_name: host_name.clone(),
                        is_host: true,
                        joined_at: now,
                    },
                )]),
                submissions: BTreeMap::new(),
                allow_guest_download: req.allow_guest_download,
                created_at: now,
                sample_file_id: None,
            };
            self.rounds.save(&round, deadline).await?;
            break (round, deadline);
        };

        tracing::info!(
            round = %round.join_code,
            round_id = %round.id,
            mode = ?round.mode,
            host_id = %host_id,
            "Round created"
        );

        if let Err(e) = self.uploads.ensure_round_dir(&round.id).await {
            tracing::warn!(round_id = %round.id, error = %e, "Could not create upload directory");
            warnings.push(Warning::UploadDirUnavailable {
                reason: e.to_string(),
            });
        }

        let (token, warning) = self
            .issue_session(&host_id, &round.join_code, deadline)
            .await;
        warnings.extend(warning);

        Ok(Outcome::with_warnings(
            RoundCreated {
                code: round.join_code,
                round_id: round.id,
                participant_id: host_id,
                host_name,
                token,
            },
            warnings,
        ))
    }

    /// Public round view plus who the caller is, if they belong to it
    pub async fn round_info(
        &self,
        code: &str,
        session: Option<&Session>,
    ) -> Result<RoundInfo, RoundError> {
        let round = self.load_round(code, self.deadline()).await?;

        let viewer = session
            .filter(|s| s.belongs_to(code))
            .and_then(|s| round.participant(&s.participant_id))
            .map(|p| Viewer {
                participant_id: p.id.clone(),
                is_host: round.is_host(&p.id),
            });

        Ok(RoundInfo { round, viewer })
    }

    /// Move a round forward (host only)
    pub async fn transition_state(
        &self,
        code: &str,
        session: Option<&Session>,
        target: RoundState,
    ) -> Result<Outcome<StateChanged>, RoundError> {
        let session = session.ok_or(RoundError::Unauthorized)?;

        let _guard = self.lock_round(code).await;
        let deadline = self.deadline();
        let mut round = self.load_round(code, deadline).await?;

        if !session.belongs_to(code) || !round.is_host(&session.participant_id) {
            return Err(RoundError::Forbidden(
                "Only the host can change the round state".to_string(),
            ));
        }

        let old_state = round.state;
        if !old_state.can_advance_to(target) {
            return Err(RoundError::rejected(
                RejectCode::InvalidTransition,
                format!("Cannot change round state from {old_state} to {target}"),
            ));
        }

        round.state = target;
        self.rounds.save(&round, deadline).await?;

        tracing::info!(
            round = %code,
            old_state = %old_state,
            new_state = %target,
            actor = %session.participant_id,
            "Round state changed"
        );

        Ok(Outcome::new(StateChanged {
            old_state,
            new_state: target,
            message: format!("Round state updated to {target}"),
        }))
    }
}
