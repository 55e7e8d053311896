use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ParticipantId, SessionId},
    task::TaskProgress,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub progress: TaskProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOverview {
    pub session: SessionSummary,
    pub participants: Vec<ParticipantSummary>,
}

/// Events fanned out to experimenter tooling on the monitor stream.
///
/// This is a one-way observer surface; nothing here is ever sent back on a
/// participant's own channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MonitorEvent {
    ParticipantJoined {
        participant: ParticipantSummary,
    },
    ProgressUpdated {
        session_id: SessionId,
        participant_id: ParticipantId,
        progress: TaskProgress,
    },
    ParticipantAdvanced {
        session_id: SessionId,
        participant_id: ParticipantId,
        advanced_at: DateTime<Utc>,
    },
}
