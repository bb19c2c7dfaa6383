use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque ID types for readability
pub type RoundId = String;
pub type ParticipantId = String;
pub type JoinCode = String;
pub type SessionToken = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundMode {
    /// Everyone remixes one host-provided sample
    Sample,
    /// Each upload is handed to the next participant in sorted-id order
    Telephone,
}

/// Round lifecycle. Declaration order is the forward order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RoundState {
    Waiting,
    Active,
    Closed,
}

impl RoundState {
    /// Forward-only policy: the target must come strictly after the current state.
    pub fn can_advance_to(self, target: RoundState) -> bool {
        target > self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundState::Waiting => "waiting",
            RoundState::Active => "active",
            RoundState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub is_host: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub participant_id: ParticipantId,
    /// Server-generated name of the file on disk
    pub filename: String,
    /// Client-supplied name, never used as a path
    pub original_name: String,
    pub uploaded_at: DateTime<Utc>,
    /// Chain successor (telephone mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<ParticipantId>,
}

/// A round is stored and replaced as one blob; participants and submissions
/// have no existence outside of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: RoundId,
    pub name: String,
    pub mode: RoundMode,
    pub join_code: JoinCode,
    pub state: RoundState,
    pub host_id: ParticipantId,
    #[serde(default)]
    pub participants: BTreeMap<ParticipantId, Participant>,
    /// At most one submission per participant
    #[serde(default)]
    pub submissions: BTreeMap<ParticipantId, Submission>,
    pub allow_guest_download: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_file_id: Option<String>,
}

impl Round {
    pub fn is_host(&self, participant_id: &str) -> bool {
        self.host_id == participant_id
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    pub fn display_name(&self, participant_id: &str) -> Option<&str> {
        self.participants
            .get(participant_id)
            .map(|p| p.display_name.as_str())
    }

    /// Telephone chain order: participant ids ascending. BTreeMap keys are
    /// already sorted, so this is just the key order.
    pub fn chain_order(&self) -> Vec<&str> {
        self.participants.keys().map(String::as_str).collect()
    }
}

/// Binding from an opaque bearer token to one participant in one round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: SessionToken,
    pub participant_id: ParticipantId,
    pub round_code: JoinCode,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn belongs_to(&self, code: &str) -> bool {
        self.round_code == code
    }
}

/// Normalise a user-typed join code (trim + uppercase)
pub fn normalize_code(code: &str) -> JoinCode {
    code.trim().to_uppercase()
}
