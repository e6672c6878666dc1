//! Quality gate orchestrator.
//!
//! Runs the pre-execution plan review and the post-execution consensus over
//! four gates. A task is approved only when every gate passes. Each call
//! appends one decision record; rejections move the task back to
//! `needs_improvement` until the attempt ceiling is reached, at which point an
//! incident blocks the task and stops automatic retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use autopilot_core::events::{EventPayload, IncidentRaisedPayload};
use autopilot_core::{
    review_plan, Config, DecisionRecord, Escalation, Id, PlanProposal, PlanReview, Task,
    TaskStatus, VerificationEvidence,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{StoreError, TaskStore};

pub const CONSENSUS_GATE: &str = "consensus";
pub const PLAN_REVIEW_GATE: &str = "plan_review";
const RESOLUTION_CEILING_REASON: &str = "resolution_ceiling";

#[derive(Debug, Error)]
pub enum GateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("task {0} has an open incident; automatic verification is halted")]
    IncidentOpen(String),
    #[error("failed to digest evidence: {0}")]
    Digest(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    pub reason: String,
}

impl GateVerdict {
    fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

pub struct GateContext<'a> {
    pub task: &'a Task,
    pub evidence: &'a VerificationEvidence,
}

/// One independent reviewer in the consensus.
pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, ctx: &GateContext<'_>) -> GateVerdict;
}

/// Build and test evidence must be present and passing, and no critic in
/// the evidence may have failed.
#[derive(Debug, Default)]
pub struct AutomatedGate;

impl Gate for AutomatedGate {
    fn name(&self) -> &'static str {
        "automated"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateVerdict {
        let evidence = ctx.evidence;
        match &evidence.build {
            None => return GateVerdict::fail("no build evidence"),
            Some(build) if !build.passed => return GateVerdict::fail("build failed"),
            Some(_) => {}
        }
        match &evidence.tests {
            None => return GateVerdict::fail("no test evidence"),
            Some(tests) if !tests.passed => return GateVerdict::fail("tests failed"),
            Some(_) => {}
        }
        let failing: Vec<&str> = evidence
            .failing_critics()
            .map(|r| r.critic_name.as_str())
            .collect();
        if failing.is_empty() {
            GateVerdict::pass("build and tests passed")
        } else {
            GateVerdict::fail(format!("critics failed: {}", failing.join(", ")))
        }
    }
}

/// Orchestrator policy: the task must have been submitted for review with a
/// summary of the work.
#[derive(Debug, Default)]
pub struct PolicyGate;

impl Gate for PolicyGate {
    fn name(&self) -> &'static str {
        "orchestrator"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateVerdict {
        if ctx.task.status != TaskStatus::NeedsReview {
            return GateVerdict::fail(format!(
                "task is {}, not needs_review",
                ctx.task.status
            ));
        }
        if ctx.evidence.summary.trim().is_empty() {
            return GateVerdict::fail("missing work summary");
        }
        GateVerdict::pass("submitted for review with summary")
    }
}

/// Looks for evidence that does not back up its claims.
#[derive(Debug, Default)]
pub struct AdversarialGate;

fn is_test_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.split('/').any(|segment| {
        segment == "tests" || segment == "test" || segment == "spec" || segment == "__tests__"
    }) || lower.contains("_test.")
        || lower.contains(".test.")
        || lower.contains("_spec.")
        || lower.contains(".spec.")
}

fn is_doc_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.starts_with("docs/")
        || lower.contains("/docs/")
        || [".md", ".rst", ".adoc", ".txt"]
            .iter()
            .any(|ext| lower.ends_with(ext))
}

impl Gate for AdversarialGate {
    fn name(&self) -> &'static str {
        "adversarial"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateVerdict {
        let evidence = ctx.evidence;
        if let Some(tests) = &evidence.tests {
            if tests.passed && tests.output.trim().is_empty() {
                return GateVerdict::fail("tests claimed passing with no output");
            }
        }
        let files = &evidence.changed_files;
        let code_changes = files
            .iter()
            .filter(|f| !is_test_path(f) && !is_doc_path(f))
            .count();
        let supporting = files
            .iter()
            .any(|f| is_test_path(f) || is_doc_path(f));
        if code_changes > 0 && !supporting {
            return GateVerdict::fail(format!(
                "{code_changes} changed code file(s) with no test or doc change"
            ));
        }
        GateVerdict::pass("evidence is consistent")
    }
}

/// Independent peer verdict. Missing reviews fail only when peer review is
/// required.
#[derive(Debug)]
pub struct PeerGate {
    required: bool,
}

impl PeerGate {
    pub fn new(required: bool) -> Self {
        Self { required }
    }
}

impl Gate for PeerGate {
    fn name(&self) -> &'static str {
        "peer"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateVerdict {
        match &ctx.evidence.peer_review {
            Some(review) if review.approved => {
                GateVerdict::pass(format!("approved by {}", review.reviewer))
            }
            Some(review) => GateVerdict::fail(format!(
                "rejected by {}: {}",
                review.reviewer, review.notes
            )),
            None if self.required => GateVerdict::fail("no peer review"),
            None => GateVerdict::pass("peer review not required"),
        }
    }
}

/// Raised when a task exhausts its resolution attempts.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub task_id: Id,
    pub attempts: u32,
    pub reasoning: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationOutcome {
    pub decision: DecisionRecord,
    pub incident: Option<Incident>,
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub max_resolution_attempts: u32,
    pub require_peer_review: bool,
    pub critic_origin: String,
}

impl GateSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_resolution_attempts: config.max_resolution_attempts,
            require_peer_review: config.require_peer_review,
            critic_origin: config.critic_history_origin.clone(),
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AttemptState {
    attempts: u32,
    incident: bool,
}

pub struct QualityGate {
    store: Arc<TaskStore>,
    gates: Vec<Box<dyn Gate>>,
    settings: GateSettings,
    /// Serializes verifications and guards per-task attempt counters.
    attempts: Mutex<HashMap<Id, AttemptState>>,
}

impl QualityGate {
    pub fn new(store: Arc<TaskStore>, settings: GateSettings) -> Self {
        let gates: Vec<Box<dyn Gate>> = vec![
            Box::new(AutomatedGate),
            Box::new(PolicyGate),
            Box::new(AdversarialGate),
            Box::new(PeerGate::new(settings.require_peer_review)),
        ];
        Self::with_gates(store, settings, gates)
    }

    pub fn with_gates(
        store: Arc<TaskStore>,
        settings: GateSettings,
        gates: Vec<Box<dyn Gate>>,
    ) -> Self {
        Self {
            store,
            gates,
            settings,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// Deterministic completeness check of a proposed plan. When `task_id` is
    /// given the review is appended to that task's decision log.
    pub async fn review_plan(&self, plan: &PlanProposal, task_id: Option<&Id>) -> PlanReview {
        let review = review_plan(plan);
        info!(
            title = %plan.title,
            approved = review.approved,
            concerns = review.concerns.len(),
            "plan reviewed"
        );
        if let Some(task_id) = task_id {
            let mut verdicts = BTreeMap::new();
            verdicts.insert("completeness".to_string(), review.approved);
            let reasoning = if review.concerns.is_empty() {
                "plan is complete".to_string()
            } else {
                review.concerns.join("; ")
            };
            let decision = DecisionRecord {
                id: Id::new(),
                task_id: task_id.clone(),
                gate_name: PLAN_REVIEW_GATE.to_string(),
                verdicts,
                consensus: review.approved,
                reasoning,
                attempt: 0,
                evidence_digest: None,
                timestamp: Utc::now(),
            };
            self.store.record_decision(&decision).await;
        }
        review
    }

    /// Run the four-gate consensus over `evidence` for a task.
    pub async fn verify(
        &self,
        task_id: &Id,
        evidence: &VerificationEvidence,
    ) -> Result<VerificationOutcome> {
        let mut attempts = self.attempts.lock().await;
        let task = self.store.get_task(task_id).await?;

        let state = match attempts.get(task_id) {
            Some(state) => *state,
            None => self.load_attempt_state(&task).await?,
        };
        if state.incident {
            return Err(GateError::IncidentOpen(task_id.to_string()));
        }

        for result in &evidence.critic_results {
            self.store
                .record_critic_result(result, &self.settings.critic_origin)
                .await;
        }

        let ctx = GateContext {
            task: &task,
            evidence,
        };
        let mut verdicts = BTreeMap::new();
        let mut failures = Vec::new();
        for gate in &self.gates {
            let verdict = gate.evaluate(&ctx);
            if !verdict.passed {
                failures.push(format!("{}: {}", gate.name(), verdict.reason));
            }
            verdicts.insert(gate.name().to_string(), verdict.passed);
        }
        let consensus = failures.is_empty();
        let reasoning = if consensus {
            "APPROVED: all gates passed".to_string()
        } else {
            format!("REJECTED by {}", failures.join("; "))
        };

        let attempt = state.attempts + 1;
        let decision = DecisionRecord {
            id: Id::new(),
            task_id: task_id.clone(),
            gate_name: CONSENSUS_GATE.to_string(),
            verdicts,
            consensus,
            reasoning: reasoning.clone(),
            attempt,
            evidence_digest: Some(evidence.digest()?),
            timestamp: Utc::now(),
        };
        self.store.record_decision(&decision).await;
        info!(task_id = %task_id, consensus, attempt, "verification decided");

        let in_review = task.status == TaskStatus::NeedsReview;
        if consensus {
            attempts.remove(task_id);
            let mut patch = Map::new();
            patch.insert("resolution".to_string(), Value::String(evidence.summary.clone()));
            self.store
                .transition(
                    task_id,
                    TaskStatus::Done,
                    Some(&patch),
                    &format!("verify:{task_id}:{}", decision.id),
                    None,
                )
                .await?;
            return Ok(VerificationOutcome {
                decision,
                incident: None,
            });
        }

        if in_review {
            let mut patch = Map::new();
            patch.insert("last_rejection".to_string(), Value::String(reasoning.clone()));
            self.store
                .transition(
                    task_id,
                    TaskStatus::NeedsImprovement,
                    Some(&patch),
                    &format!("verify:{task_id}:{}", decision.id),
                    None,
                )
                .await?;
        }

        if attempt < self.settings.max_resolution_attempts {
            attempts.insert(
                task_id.clone(),
                AttemptState {
                    attempts: attempt,
                    incident: false,
                },
            );
            return Ok(VerificationOutcome {
                decision,
                incident: None,
            });
        }

        let incident = self.raise_incident(task_id, attempt, &reasoning).await?;
        attempts.insert(
            task_id.clone(),
            AttemptState {
                attempts: attempt,
                incident: true,
            },
        );
        Ok(VerificationOutcome {
            decision,
            incident: Some(incident),
        })
    }

    /// Drop the incident hold on a task after external intervention.
    pub async fn clear_incident(&self, task_id: &Id) {
        self.attempts.lock().await.insert(task_id.clone(), AttemptState::default());
    }

    async fn raise_incident(
        &self,
        task_id: &Id,
        attempts: u32,
        reasoning: &str,
    ) -> Result<Incident> {
        let incident = Incident {
            task_id: task_id.clone(),
            attempts,
            reasoning: reasoning.to_string(),
            raised_at: Utc::now(),
        };
        warn!(task_id = %task_id, attempts, "resolution ceiling reached, raising incident");
        self.store
            .record_event(
                Some(task_id),
                None,
                &EventPayload::IncidentRaised(IncidentRaisedPayload {
                    attempts,
                    reasoning: reasoning.to_string(),
                }),
            )
            .await;

        let escalation = Escalation {
            reason: RESOLUTION_CEILING_REASON.to_string(),
            note: format!("not approved after {attempts} attempts; last: {reasoning}"),
            count: attempts,
            at: incident.raised_at,
        };
        let mut patch = Map::new();
        patch.insert("escalation".to_string(), serde_json::to_value(&escalation)?);
        match self
            .store
            .transition(
                task_id,
                TaskStatus::Blocked,
                Some(&patch),
                &format!("incident:{task_id}:{attempts}"),
                None,
            )
            .await
        {
            Ok(_) | Err(StoreError::InvalidTransition { .. }) => Ok(incident),
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild attempt state for a task not seen since startup.
    async fn load_attempt_state(&self, task: &Task) -> Result<AttemptState> {
        let decisions = self.store.list_decisions(&task.id).await?;
        let attempts = decisions
            .iter()
            .filter(|d| d.gate_name == CONSENSUS_GATE)
            .map(|d| d.attempt)
            .max()
            .unwrap_or(0);
        let incident = task.status == TaskStatus::Blocked
            && task
                .metadata
                .escalation
                .as_ref()
                .is_some_and(|e| e.reason == RESOLUTION_CEILING_REASON);
        // An approved or reopened task starts a fresh resolution loop.
        let approved = decisions
            .iter()
            .rev()
            .find(|d| d.gate_name == CONSENSUS_GATE)
            .is_some_and(|d| d.consensus);
        Ok(AttemptState {
            attempts: if approved { 0 } else { attempts },
            incident,
        })
    }
}
