//! Event types for the audit log.
//!
//! Events are append-only. `event_type` is stored as the SCREAMING_SNAKE_CASE
//! name and `data` as the JSON-serialized payload.

use crate::types::{Id, TaskStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskCreated,
    TaskTransitioned,
    TaskAmended,
    /// Task moved out of the automatic loop (repeated lease expiry).
    TaskEscalated,
    LeaseExpired,
    DecisionRecorded,
    /// Resolution-loop ceiling reached; needs a human.
    IncidentRaised,
    ContextAdded,
    CheckpointCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskTransitioned => "TASK_TRANSITIONED",
            Self::TaskAmended => "TASK_AMENDED",
            Self::TaskEscalated => "TASK_ESCALATED",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::DecisionRecorded => "DECISION_RECORDED",
            Self::IncidentRaised => "INCIDENT_RAISED",
            Self::ContextAdded => "CONTEXT_ADDED",
            Self::CheckpointCreated => "CHECKPOINT_CREATED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload for TASK_CREATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedPayload {
    pub title: String,
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_of: Option<Id>,
}

/// Payload for TASK_TRANSITIONED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTransitionedPayload {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_patch: Option<serde_json::Value>,
}

/// Payload for TASK_AMENDED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAmendedPayload {
    pub correlation_id: String,
    /// Metadata keys touched by the patch.
    pub keys: Vec<String>,
    pub description_changed: bool,
}

/// Payload for TASK_ESCALATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEscalatedPayload {
    pub reason: String,
    pub count: u32,
}

/// Payload for LEASE_EXPIRED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseExpiredPayload {
    pub holder: String,
    pub expiries: u32,
    /// Backoff before the task becomes eligible again; absent when escalated.
    pub retry_after_sec: Option<u64>,
}

/// Payload for DECISION_RECORDED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecordedPayload {
    pub decision_id: Id,
    pub consensus: bool,
    pub attempt: u32,
}

/// Payload for INCIDENT_RAISED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRaisedPayload {
    pub attempts: u32,
    pub reasoning: String,
}

/// Payload for CONTEXT_ADDED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAddedPayload {
    pub entry_id: Id,
    pub topic: String,
}

/// Payload for CHECKPOINT_CREATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointCreatedPayload {
    pub checkpoint_id: Id,
    pub label: String,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    TaskCreated(TaskCreatedPayload),
    TaskTransitioned(TaskTransitionedPayload),
    TaskAmended(TaskAmendedPayload),
    TaskEscalated(TaskEscalatedPayload),
    LeaseExpired(LeaseExpiredPayload),
    DecisionRecorded(DecisionRecordedPayload),
    IncidentRaised(IncidentRaisedPayload),
    ContextAdded(ContextAddedPayload),
    CheckpointCreated(CheckpointCreatedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskCreated(_) => EventType::TaskCreated,
            Self::TaskTransitioned(_) => EventType::TaskTransitioned,
            Self::TaskAmended(_) => EventType::TaskAmended,
            Self::TaskEscalated(_) => EventType::TaskEscalated,
            Self::LeaseExpired(_) => EventType::LeaseExpired,
            Self::DecisionRecorded(_) => EventType::DecisionRecorded,
            Self::IncidentRaised(_) => EventType::IncidentRaised,
            Self::ContextAdded(_) => EventType::ContextAdded,
            Self::CheckpointCreated(_) => EventType::CheckpointCreated,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
