//! Upload acceptance and routing.
//!
//! `route_submission` is the pure per-mode policy; the `AppState` methods
//! wrap it with the file write -> round save -> old file delete sequence.

use super::AppState;
use crate::error::{RejectCode, RoundError};
use crate::files::{FileOwner, UploadedFile};
use crate::protocol::{Outcome, SampleReceipt, UploadReceipt};
use crate::store::Deadline;
use crate::types::*;
use chrono::Utc;

/// What the router decided for one accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// Chain successor (telephone mode)
    pub assigned_to_id: Option<ParticipantId>,
    /// The upload becomes the round's sample (telephone chain head)
    pub seeds_chain: bool,
}

/// Decide whether `participant_id` may upload to `round` right now and
/// where the upload goes.
pub fn route_submission(round: &Round, participant_id: &str) -> Result<Routing, RoundError> {
    if round.state != RoundState::Active {
        return Err(RoundError::rejected(
            RejectCode::RoundNotActive,
            "Uploads are only allowed when the round is active",
        ));
    }

    match round.mode {
        RoundMode::Sample => {
            if round.sample_file_id.is_none() {
                return Err(RoundError::rejected(
                    RejectCode::SampleMissing,
                    "Waiting for host to upload sample file first",
                ));
            }
            Ok(Routing {
                assigned_to_id: None,
                seeds_chain: false,
            })
        }
        RoundMode::Telephone => {
            let order = round.chain_order();
            let position = order.iter().position(|id| *id == participant_id);
            let seeds_chain = position == Some(0);

            // Replacements keep the successor they were first given
            let assigned_to_id = match round.submissions.get(participant_id) {
                Some(previous) => previous.assigned_to_id.clone(),
                None => position
                    .and_then(|i| order.get(i + 1))
                    .map(|id| id.to_string()),
            };

            Ok(Routing {
                assigned_to_id,
                seeds_chain,
            })
        }
    }
}

/// Caller and routing for a participant upload, checked against `round`.
/// Everything here is decided before the request body matters.
fn admit_submission(round: &Round, session: &Session) -> Result<(String, Routing), RoundError> {
    let participant_id = session.participant_id.as_str();
    let uploaded_by = round
        .display_name(participant_id)
        .ok_or(RoundError::NotParticipant)?
        .to_string();
    let routing = route_submission(round, participant_id)?;
    Ok((uploaded_by, routing))
}

/// Host, mode and state checks for a sample upload
fn admit_sample(round: &Round, session: &Session) -> Result<(), RoundError> {
    if !session.belongs_to(&round.join_code) || !round.is_host(&session.participant_id) {
        return Err(RoundError::Forbidden(
            "Only the host can upload the sample file".to_string(),
        ));
    }
    if round.mode != RoundMode::Sample {
        return Err(RoundError::rejected(
            RejectCode::WrongMode,
            "Sample uploads are only available in sample mode",
        ));
    }
    if round.state != RoundState::Waiting {
        return Err(RoundError::rejected(
            RejectCode::SampleLocked,
            "The sample can only be changed before the round starts",
        ));
    }
    Ok(())
}

/// Session present and issued for this round
fn uploader<'a>(code: &str, session: Option<&'a Session>) -> Result<&'a Session, RoundError> {
    let session = session.ok_or(RoundError::Unauthorized)?;
    if !session.belongs_to(code) {
        return Err(RoundError::NotParticipant);
    }
    Ok(session)
}

fn no_file() -> RoundError {
    RoundError::invalid(RejectCode::NoFile, "No file provided")
}

fn upload_message(round: &Round, assigned_to: Option<&str>, is_replacement: bool) -> String {
    match (round.mode, assigned_to, is_replacement) {
        (RoundMode::Sample, _, true) => "Your remix has been updated successfully!".to_string(),
        (RoundMode::Sample, _, false) => "Your remix has been uploaded successfully!".to_string(),
        (RoundMode::Telephone, Some(name), true) => {
            format!("Your updated upload will be passed to {name}")
        }
        (RoundMode::Telephone, Some(name), false) => format!("Your upload will be passed to {name}"),
        (RoundMode::Telephone, None, true) => {
            "Your updated upload is the last in the telephone chain!".to_string()
        }
        (RoundMode::Telephone, None, false) => {
            "Your upload is the last in the telephone chain!".to_string()
        }
    }
}

impl AppState {
    /// Save `round`, removing `new_file` again if the save fails
    async fn commit_upload(
        &self,
        round: &Round,
        new_file: &str,
        deadline: Deadline,
    ) -> Result<(), RoundError> {
        let Err(save) = self.rounds.save(round, deadline).await else {
            return Ok(());
        };

        tracing::error!(
            round = %round.join_code,
            filename = new_file,
            error = %save,
            "Round save failed after upload, rolling back file"
        );
        match self.uploads.remove(&round.id, new_file).await {
            Ok(()) => Err(save.into()),
            Err(rollback) => Err(RoundError::RollbackFailed {
                filename: new_file.to_string(),
                save,
                rollback,
            }),
        }
    }

    /// Would `upload_submission` accept a file from this caller right now?
    ///
    /// Lets the HTTP layer refuse before reading a multipart body. The same
    /// checks run again under the round lock.
    pub async fn check_upload(
        &self,
        code: &str,
        session: Option<&Session>,
    ) -> Result<(), RoundError> {
        let session = uploader(code, session)?;
        let round = self.load_round(code, self.deadline()).await?;
        admit_submission(&round, session).map(|_| ())
    }

    /// Record a participant's upload
    pub async fn upload_submission(
        &self,
        code: &str,
        session: Option<&Session>,
        file: Option<UploadedFile>,
    ) -> Result<Outcome<UploadReceipt>, RoundError> {
        let session = uploader(code, session)?;
        let participant_id = session.participant_id.as_str();

        let guard = self.lock_round(code).await;
        let deadline = self.deadline();
        let mut round = self.load_round(code, deadline).await?;

        let (uploaded_by, routing) = admit_submission(&round, session)?;
        let file = file.ok_or_else(no_file)?;
        let ext = file.validate()?;

        let stored = self
            .uploads
            .write_new(&round.id, FileOwner::Participant(participant_id), ext, &file.bytes)
            .await?;

        let previous = round.submissions.insert(
            participant_id.to_string(),
            Submission {
                participant_id: participant_id.to_string(),
                filename: stored.filename.clone(),
                original_name: file.original_name.clone(),
                uploaded_at: Utc::now(),
                assigned_to_id: routing.assigned_to_id.clone(),
            },
        );
        if routing.seeds_chain {
            round.sample_file_id = Some(stored.filename.clone());
        }

        self.commit_upload(&round, &stored.filename, deadline).await?;
        drop(guard);

        let is_replacement = previous.is_some();
        let assigned_to = routing
            .assigned_to_id
            .as_deref()
            .and_then(|id| round.display_name(id))
            .map(str::to_string);

        tracing::info!(
            round = %code,
            participant_id,
            filename = %stored.filename,
            assigned_to_id = ?routing.assigned_to_id,
            is_replacement,
            "Submission stored"
        );

        let mut warnings = Vec::new();
        if let Some(old) = previous {
            warnings.extend(self.uploads.discard_superseded(&round.id, &old.filename).await);
        }

        let message = upload_message(&round, assigned_to.as_deref(), is_replacement);
        Ok(Outcome::with_warnings(
            UploadReceipt {
                filename: stored.filename,
                original_name: file.original_name,
                size: stored.size,
                uploaded_by,
                is_replacement,
                assigned_to,
                assigned_to_id: routing.assigned_to_id,
                message,
            },
            warnings,
        ))
    }

    /// Pre-body counterpart of `upload_sample`
    pub async fn check_sample_upload(
        &self,
        code: &str,
        session: Option<&Session>,
    ) -> Result<(), RoundError> {
        let session = session.ok_or(RoundError::Unauthorized)?;
        let round = self.load_round(code, self.deadline()).await?;
        admit_sample(&round, session)
    }

    /// Store the host's sample (sample mode, before the round starts)
    pub async fn upload_sample(
        &self,
        code: &str,
        session: Option<&Session>,
        file: Option<UploadedFile>,
    ) -> Result<Outcome<SampleReceipt>, RoundError> {
        let session = session.ok_or(RoundError::Unauthorized)?;

        let guard = self.lock_round(code).await;
        let deadline = self.deadline();
        let mut round = self.load_round(code, deadline).await?;
        admit_sample(&round, session)?;

        let file = file.ok_or_else(no_file)?;
        let ext = file.validate()?;
        let stored = self
            .uploads
            .write_new(&round.id, FileOwner::Sample, ext, &file.bytes)
            .await?;

        let previous = round.sample_file_id.replace(stored.filename.clone());
        self.commit_upload(&round, &stored.filename, deadline).await?;
        drop(guard);

        tracing::info!(round = %code, filename = %stored.filename, "Sample stored");

        let mut warnings = Vec::new();
        if let Some(old) = &previous {
            warnings.extend(self.uploads.discard_superseded(&round.id, old).await);
        }

        let is_replacement = previous.is_some();
        let message = if is_replacement {
            "Sample replaced successfully! The new sample will be used when the round starts."
        } else {
            "Sample uploaded successfully! Participants can download and create remixes once the round starts."
        };

        Ok(Outcome::with_warnings(
            SampleReceipt {
                filename: stored.filename,
                original_name: file.original_name,
                size: stored.size,
                is_replacement,
                message: message.to_string(),
            },
            warnings,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn round(mode: RoundMode, ids: &[&str]) -> Round {
        Round {
            id: "round_1".to_string(),
            name: "Jam".to_string(),
            mode,
            join_code: "ABC123".to_string(),
            state: RoundState::Active,
            host_id: "h".to_string(),
            participants: ids
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        Participant {
                            id: id.to_string(),
                            display_name: id.to_uppercase(),
                            is_host: false,
                            joined_at: Utc::now(),
                        },
                    )
                })
                .collect(),
            submissions: BTreeMap::new(),
            allow_guest_download: false,
            created_at: Utc::now(),
            sample_file_id: None,
        }
    }

    fn submitted(round: &mut Round, id: &str, assigned: Option<&str>) {
        round.submissions.insert(
            id.to_string(),
            Submission {
                participant_id: id.to_string(),
                filename: format!("{id}_old.mp3"),
                original_name: "old.mp3".to_string(),
                uploaded_at: Utc::now(),
                assigned_to_id: assigned.map(str::to_string),
            },
        );
    }

    #[test]
    fn test_telephone_chain_is_sorted_path() {
        let r = round(RoundMode::Telephone, &["c3", "a1", "b2"]);

        let a = route_submission(&r, "a1").unwrap();
        assert_eq!(a.assigned_to_id.as_deref(), Some("b2"));
        assert!(a.seeds_chain);

        let b = route_submission(&r, "b2").unwrap();
        assert_eq!(b.assigned_to_id.as_deref(), Some("c3"));
        assert!(!b.seeds_chain);

        let c = route_submission(&r, "c3").unwrap();
        assert_eq!(c.assigned_to_id, None);
        assert!(!c.seeds_chain);
    }

    #[test]
    fn test_telephone_replacement_keeps_assignment() {
        let mut r = round(RoundMode::Telephone, &["a1", "b2", "c3"]);
        submitted(&mut r, "a1", Some("c3"));

        let routing = route_submission(&r, "a1").unwrap();
        assert_eq!(routing.assigned_to_id.as_deref(), Some("c3"));
        // Chain head still refreshes the seed on replacement
        assert!(routing.seeds_chain);
    }

    #[test]
    fn test_sample_mode_needs_sample() {
        let mut r = round(RoundMode::Sample, &["h", "p1"]);
        let err = route_submission(&r, "p1").unwrap_err();
        assert_eq!(err.code(), "SAMPLE_MISSING");

        r.sample_file_id = Some("SAMPLE_x.mp3".to_string());
        let routing = route_submission(&r, "p1").unwrap();
        assert_eq!(
            routing,
            Routing {
                assigned_to_id: None,
                seeds_chain: false
            }
        );
    }

    #[test]
    fn test_inactive_round_rejects_before_mode_checks() {
        for state in [RoundState::Waiting, RoundState::Closed] {
            let mut r = round(RoundMode::Sample, &["h", "p1"]);
            r.state = state;
            let err = route_submission(&r, "p1").unwrap_err();
            assert_eq!(err.code(), "ROUND_NOT_ACTIVE");
        }
    }

    #[test]
    fn test_single_participant_chain_has_no_successor() {
        let r = round(RoundMode::Telephone, &["solo"]);
        let routing = route_submission(&r, "solo").unwrap();
        assert!(routing.seeds_chain);
        assert_eq!(routing.assigned_to_id, None);
    }

    #[test]
    fn test_upload_messages() {
        let tel = round(RoundMode::Telephone, &["a1"]);
        assert_eq!(
            upload_message(&tel, Some("Bob"), false),
            "Your upload will be passed to Bob"
        );
        assert_eq!(
            upload_message(&tel, None, true),
            "Your updated upload is the last in the telephone chain!"
        );
        let sample = round(RoundMode::Sample, &["a1"]);
        assert_eq!(
            upload_message(&sample, None, false),
            "Your remix has been uploaded successfully!"
        );
    }
}
