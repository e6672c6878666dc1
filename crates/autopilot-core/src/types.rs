//! Core types for the autopilot control plane.
//!
//! Tasks, the audit records hanging off them, and the small enums shared by
//! the scheduler, quality gate and critic monitor.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::TaskMetadata;

/// Unique identifier for tasks, events, decisions and checkpoints.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// --- Enumerations ---

/// Task lifecycle status.
///
/// Edges:
/// - pending -> in_progress (assign)
/// - in_progress -> needs_review (submit)
/// - needs_review -> done (approve) | needs_improvement (reject)
/// - needs_improvement -> in_progress (retry)
/// - any non-terminal -> blocked, blocked -> pending (unblock)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    NeedsReview,
    NeedsImprovement,
    Blocked,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::InProgress,
        Self::NeedsReview,
        Self::NeedsImprovement,
        Self::Blocked,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::NeedsReview => "needs_review",
            Self::NeedsImprovement => "needs_improvement",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }

    /// `done` has no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether `self -> target` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::{Blocked, Done, InProgress, NeedsImprovement, NeedsReview, Pending};
        match (self, target) {
            (Pending, InProgress)
            | (InProgress, NeedsReview)
            | (NeedsReview, Done | NeedsImprovement)
            | (NeedsImprovement, InProgress)
            | (Blocked, Pending) => true,
            (from, Blocked) => !from.is_terminal() && *from != Blocked,
            _ => false,
        }
    }

    /// Shortest legal path from `self` to `done`, excluding `self`.
    pub fn path_to_done(&self) -> Vec<TaskStatus> {
        use TaskStatus::{Blocked, Done, InProgress, NeedsImprovement, NeedsReview, Pending};
        match self {
            Done => Vec::new(),
            NeedsReview => vec![Done],
            InProgress => vec![NeedsReview, Done],
            Pending | NeedsImprovement => vec![InProgress, NeedsReview, Done],
            Blocked => vec![Pending, InProgress, NeedsReview, Done],
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "task status",
                value: s.to_string(),
            })
    }
}

/// Priority lane. Declaration order is priority order (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Interactive,
    Critical,
    #[default]
    Background,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Self::Interactive, Self::Critical, Self::Background];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Critical => "critical",
            Self::Background => "background",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Interactive => 0,
            Self::Critical => 1,
            Self::Background => 2,
        }
    }
}

impl FromStr for Lane {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|lane| lane.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "lane",
                value: s.to_string(),
            })
    }
}

/// Escalation severity for remediation tasks. `Director` outranks `Autopilot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Autopilot,
    Director,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autopilot => "autopilot",
            Self::Director => "director",
        }
    }
}

/// Kind of free-form reasoning entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEntryType {
    Decision,
    Hypothesis,
    Learning,
}

impl ContextEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Hypothesis => "hypothesis",
            Self::Learning => "learning",
        }
    }
}

impl FromStr for ContextEntryType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(Self::Decision),
            "hypothesis" => Ok(Self::Hypothesis),
            "learning" => Ok(Self::Learning),
            _ => Err(ParseEnumError {
                kind: "context entry type",
                value: s.to_string(),
            }),
        }
    }
}

// --- Records ---

/// A unit of work tracked through the lifecycle state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub title: String,
    pub description: String,
    /// Free-form work type (e.g. `feature`, `bug`, `remediation`).
    pub task_type: String,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub metadata: TaskMetadata,
    pub parent_id: Option<Id>,
    pub epic_id: Option<Id>,
    pub milestone_id: Option<Id>,
    /// Tasks that must be `done` before this one is ready.
    #[serde(default)]
    pub depends_on: Vec<Id>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for creating a task. New tasks always start as `pending`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub assigned_to: Option<String>,
    pub metadata: TaskMetadata,
    pub parent_id: Option<Id>,
    pub epic_id: Option<Id>,
    pub milestone_id: Option<Id>,
    pub depends_on: Vec<Id>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            task_type: task_type.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependency(mut self, id: Id) -> Self {
        self.depends_on.push(id);
        self
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An immutable entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub timestamp: DateTime<Utc>,
    /// Event type name (e.g. `TASK_CREATED`, `TASK_TRANSITIONED`).
    pub event_type: String,
    pub task_id: Option<Id>,
    pub agent: Option<String>,
    pub data: serde_json::Value,
}

/// Numeric score attached to a task by a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    pub task_id: Id,
    pub dimension: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only reasoning trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: Id,
    pub entry_type: ContextEntryType,
    pub topic: String,
    pub content: String,
    #[serde(default)]
    pub related_tasks: Vec<Id>,
    pub confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// One observation of a critic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticHistoryRecord {
    pub critic_name: String,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
    /// Where the observation came from (`runtime`, `test`, `synthetic`, ...).
    pub origin: String,
    pub metadata: serde_json::Value,
}

/// Recovery checkpoint for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Id,
    pub task_id: Id,
    pub label: String,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One consensus review invocation. Never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Id,
    pub task_id: Id,
    /// Review stage that produced the record (`post_execution`, ...).
    pub gate_name: String,
    pub verdicts: BTreeMap<String, bool>,
    pub consensus: bool,
    pub reasoning: String,
    /// 1-indexed attempt number within the resolution loop.
    pub attempt: u32,
    /// SHA-256 of the serialized evidence the verdicts were computed from.
    pub evidence_digest: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate task counts served from the store cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoadmapHealth {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub open_remediation: usize,
    /// Percentage of tasks in `done`, 0-100.
    pub completion_pct: f64,
    /// Fraction of tasks currently `blocked`, 0-1.
    pub blocked_ratio: f64,
}

impl RoadmapHealth {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}
