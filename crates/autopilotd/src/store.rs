//! Task store: the lifecycle state machine over `Storage`.
//!
//! All task mutations go through `transition` or `amend`, serialized per task
//! id and made replay-safe by correlation id. Every committed write bumps a
//! monotonic version that the roadmap health cache is keyed on, and publishes
//! a notification on the event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use autopilot_core::events::{
    CheckpointCreatedPayload, ContextAddedPayload, DecisionRecordedPayload, EventPayload,
    TaskAmendedPayload, TaskCreatedPayload, TaskTransitionedPayload,
};
use autopilot_core::{
    Checkpoint, ContextEntry, ContextEntryType, CriticHistoryRecord, CriticResult, DecisionRecord,
    Event, Id, NewTask, QualityMetric, RoadmapHealth, Task, TaskStatus,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::metrics::AuditMetrics;
use crate::notify::{EventBus, StoreNotification};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {task_id} is {status}, not done")]
    NotTerminal { task_id: String, status: TaskStatus },
    #[error("task {0} is done and cannot be amended")]
    Closed(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("open remediation task already exists for {0}")]
    DuplicateRemediation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TaskNotFound(id) => Self::TaskNotFound(id),
            other => Self::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Result of a `transition` or `amend` call. `applied` is false when the
/// correlation id had already been applied and the call was a no-op.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeOutcome {
    pub task: Task,
    pub applied: bool,
}

/// Dispatcher input, bucketed in a single pass over one query.
#[derive(Debug, Clone, Default)]
pub struct SchedulingCandidates {
    pub needs_review: Vec<Task>,
    pub needs_improvement: Vec<Task>,
    pub ready: Vec<Task>,
}

impl SchedulingCandidates {
    pub fn len(&self) -> usize {
        self.needs_review.len() + self.needs_improvement.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Input for a context entry append.
#[derive(Debug, Clone)]
pub struct NewContextEntry {
    pub entry_type: ContextEntryType,
    pub topic: String,
    pub content: String,
    pub related_tasks: Vec<Id>,
    pub confidence: Option<f64>,
}

pub struct TaskStore {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    audit: Arc<AuditMetrics>,
    task_locks: Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>,
    /// Serializes remediation creation so each key has at most one open task.
    remediation_lock: AsyncMutex<()>,
    version: AtomicU64,
    health_cache: Mutex<Option<(u64, RoadmapHealth)>>,
}

impl TaskStore {
    pub fn new(storage: Arc<Storage>, bus: Arc<EventBus>, audit: Arc<AuditMetrics>) -> Self {
        Self {
            storage,
            bus,
            audit,
            task_locks: Mutex::new(HashMap::new()),
            remediation_lock: AsyncMutex::new(()),
            version: AtomicU64::new(0),
            health_cache: Mutex::new(None),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn audit(&self) -> &Arc<AuditMetrics> {
        &self.audit
    }

    /// Monotonic write counter.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    // --- Task creation ---

    /// Insert a new `pending` task with a `TASK_CREATED` event.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(StoreError::InvalidInput("task title is empty".to_string()));
        }
        for dependency in &new.depends_on {
            if !self.storage.task_exists(dependency).await? {
                return Err(StoreError::TaskNotFound(dependency.to_string()));
            }
        }

        let _remediation_guard = match new.metadata.remediation_key() {
            Some(key) => {
                let guard = self.remediation_lock.lock().await;
                if self.storage.find_open_remediation(&key).await?.is_some() {
                    return Err(StoreError::DuplicateRemediation(key));
                }
                Some(guard)
            }
            None => None,
        };

        let now = Utc::now();
        let task = Task {
            id: Id::new(),
            title: new.title,
            description: new.description,
            task_type: if new.task_type.is_empty() {
                "task".to_string()
            } else {
                new.task_type
            },
            status: TaskStatus::Pending,
            assigned_to: new.assigned_to,
            metadata: new.metadata,
            parent_id: new.parent_id,
            epic_id: new.epic_id,
            milestone_id: new.milestone_id,
            depends_on: new.depends_on,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let payload = EventPayload::TaskCreated(TaskCreatedPayload {
            title: task.title.clone(),
            task_type: task.task_type.clone(),
            revision_of: task.metadata.revision_of.clone(),
        });
        let event = build_event(&payload, Some(&task.id), None)?;
        self.storage.insert_task(&task, &event).await?;
        self.bump_version();

        info!(task_id = %task.id, title = %task.title, "task created");
        self.bus.publish(StoreNotification::TaskCreated {
            task_id: task.id.clone(),
        });
        Ok(task)
    }

    /// Reopen completed work as a new task that references the done one.
    pub async fn create_revision(&self, done_task_id: &Id, mut new: NewTask) -> Result<Task> {
        let source = self.storage.get_task(done_task_id).await?;
        if source.status != TaskStatus::Done {
            return Err(StoreError::NotTerminal {
                task_id: done_task_id.to_string(),
                status: source.status,
            });
        }
        new.metadata.revision_of = Some(done_task_id.clone());
        if new.title.trim().is_empty() {
            new.title = format!("Revision: {}", source.title);
        }
        if new.task_type.is_empty() {
            new.task_type = source.task_type;
        }
        self.create_task(new).await
    }

    // --- Mutation ---

    /// Move a task along one lifecycle edge.
    ///
    /// Replays of an applied correlation id return the current task with
    /// `applied: false`. Illegal edges fail with `InvalidTransition` and leave
    /// the task unchanged.
    pub async fn transition(
        &self,
        task_id: &Id,
        to: TaskStatus,
        patch: Option<&Map<String, Value>>,
        correlation_id: &str,
        agent: Option<&str>,
    ) -> Result<ChangeOutcome> {
        let lock = self.task_lock(task_id);
        let result = {
            let _guard = lock.lock().await;
            self.transition_locked(task_id, to, patch, correlation_id, agent)
                .await
        };
        self.release_task_lock(task_id, lock);
        result
    }

    async fn transition_locked(
        &self,
        task_id: &Id,
        to: TaskStatus,
        patch: Option<&Map<String, Value>>,
        correlation_id: &str,
        agent: Option<&str>,
    ) -> Result<ChangeOutcome> {
        if self.storage.is_correlation_applied(correlation_id).await? {
            debug!(task_id = %task_id, correlation_id, "transition replay ignored");
            let task = self.storage.get_task(task_id).await?;
            return Ok(ChangeOutcome {
                task,
                applied: false,
            });
        }

        let current = self.storage.get_task(task_id).await?;
        let from = current.status;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                task_id: task_id.to_string(),
                from,
                to,
            });
        }

        let mut updated = current;
        if let Some(patch) = patch {
            updated
                .metadata
                .apply_patch(patch)
                .map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
        }
        let now = Utc::now();
        updated.status = to;
        updated.updated_at = now;
        match to {
            TaskStatus::InProgress => {
                if updated.started_at.is_none() {
                    updated.started_at = Some(now);
                }
                // An explicit assignment (e.g. a remediation role) survives pickup.
                if updated.assigned_to.is_none() {
                    updated.assigned_to = agent.map(str::to_string);
                }
            }
            TaskStatus::Done => updated.completed_at = Some(now),
            _ => {}
        }

        let payload = EventPayload::TaskTransitioned(TaskTransitionedPayload {
            from,
            to,
            correlation_id: correlation_id.to_string(),
            metadata_patch: patch.map(|p| Value::Object(p.clone())),
        });
        let event = build_event(&payload, Some(task_id), agent)?;

        if !self
            .storage
            .commit_task_change(&updated, correlation_id, &event)
            .await?
        {
            let task = self.storage.get_task(task_id).await?;
            return Ok(ChangeOutcome {
                task,
                applied: false,
            });
        }
        self.bump_version();

        info!(task_id = %task_id, from = %from, to = %to, "task transitioned");
        self.bus.publish(StoreNotification::TaskTransitioned {
            task_id: task_id.clone(),
            from,
            to,
        });
        Ok(ChangeOutcome {
            task: updated,
            applied: true,
        })
    }

    /// Update metadata and/or description without changing status.
    pub async fn amend(
        &self,
        task_id: &Id,
        patch: &Map<String, Value>,
        description: Option<&str>,
        correlation_id: &str,
    ) -> Result<ChangeOutcome> {
        let lock = self.task_lock(task_id);
        let result = {
            let _guard = lock.lock().await;
            self.amend_locked(task_id, patch, description, correlation_id)
                .await
        };
        self.release_task_lock(task_id, lock);
        result
    }

    async fn amend_locked(
        &self,
        task_id: &Id,
        patch: &Map<String, Value>,
        description: Option<&str>,
        correlation_id: &str,
    ) -> Result<ChangeOutcome> {
        if self.storage.is_correlation_applied(correlation_id).await? {
            let task = self.storage.get_task(task_id).await?;
            return Ok(ChangeOutcome {
                task,
                applied: false,
            });
        }

        let mut updated = self.storage.get_task(task_id).await?;
        if updated.status.is_terminal() {
            return Err(StoreError::Closed(task_id.to_string()));
        }
        let previous_key = updated.metadata.remediation_key();
        updated
            .metadata
            .apply_patch(patch)
            .map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
        if updated.metadata.remediation_key() != previous_key {
            return Err(StoreError::InvalidMetadata(
                "remediation scope cannot change on amend".to_string(),
            ));
        }
        let description_changed = description.is_some_and(|d| d != updated.description);
        if let Some(description) = description {
            updated.description = description.to_string();
        }
        updated.updated_at = Utc::now();

        let payload = EventPayload::TaskAmended(TaskAmendedPayload {
            correlation_id: correlation_id.to_string(),
            keys: patch.keys().cloned().collect(),
            description_changed,
        });
        let event = build_event(&payload, Some(task_id), None)?;

        if !self
            .storage
            .commit_task_change(&updated, correlation_id, &event)
            .await?
        {
            let task = self.storage.get_task(task_id).await?;
            return Ok(ChangeOutcome {
                task,
                applied: false,
            });
        }
        self.bump_version();

        debug!(task_id = %task_id, "task amended");
        self.bus.publish(StoreNotification::TaskAmended {
            task_id: task_id.clone(),
        });
        Ok(ChangeOutcome {
            task: updated,
            applied: true,
        })
    }

    /// Walk the shortest legal path to `done`, recording `summary` as the
    /// resolution on the final edge.
    pub async fn drive_to_done(
        &self,
        task_id: &Id,
        agent: &str,
        summary: &str,
        correlation_prefix: &str,
    ) -> Result<Task> {
        let mut task = self.get_task(task_id).await?;
        for (step, status) in task.status.path_to_done().into_iter().enumerate() {
            let patch = if status == TaskStatus::Done {
                let mut patch = Map::new();
                patch.insert("resolution".to_string(), Value::String(summary.to_string()));
                Some(patch)
            } else {
                None
            };
            let correlation_id = format!("{correlation_prefix}:{step}:{status}");
            task = self
                .transition(task_id, status, patch.as_ref(), &correlation_id, Some(agent))
                .await?
                .task;
        }
        Ok(task)
    }

    // --- Queries ---

    pub async fn get_task(&self, task_id: &Id) -> Result<Task> {
        Ok(self.storage.get_task(task_id).await?)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        Ok(self.storage.list_tasks(status).await?)
    }

    /// Pending tasks whose dependencies are all done.
    pub async fn get_ready_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.storage.ready_tasks().await?)
    }

    pub async fn scheduling_candidates(&self) -> Result<SchedulingCandidates> {
        let mut candidates = SchedulingCandidates::default();
        for task in self.storage.scheduling_candidates().await? {
            match task.status {
                TaskStatus::NeedsReview => candidates.needs_review.push(task),
                TaskStatus::NeedsImprovement => candidates.needs_improvement.push(task),
                TaskStatus::Pending => candidates.ready.push(task),
                _ => {}
            }
        }
        Ok(candidates)
    }

    pub async fn find_open_remediation(&self, key: &str) -> Result<Option<Task>> {
        Ok(self.storage.find_open_remediation(key).await?)
    }

    pub async fn count_open_critic_remediations(&self) -> Result<usize> {
        Ok(self.storage.count_open_critic_remediations().await?)
    }

    /// Aggregate counts, recomputed only when the store version has moved.
    pub async fn get_roadmap_health(&self) -> Result<RoadmapHealth> {
        let version = self.version();
        if let Some((cached_version, health)) = self
            .health_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if *cached_version == version {
                return Ok(health.clone());
            }
        }

        let counts = self.storage.status_counts().await?;
        let open_remediation = self.storage.count_open_remediations().await?;
        let total: usize = counts.iter().map(|(_, count)| count).sum();
        let mut health = RoadmapHealth {
            total,
            open_remediation,
            ..RoadmapHealth::default()
        };
        for (status, count) in counts {
            health.by_status.insert(status, count);
        }
        if total > 0 {
            health.completion_pct = health.count(TaskStatus::Done) as f64 * 100.0 / total as f64;
            health.blocked_ratio = health.count(TaskStatus::Blocked) as f64 / total as f64;
        }

        *self
            .health_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((version, health.clone()));
        Ok(health)
    }

    pub async fn list_events(&self, task_id: Option<&Id>) -> Result<Vec<Event>> {
        Ok(self.storage.list_events(task_id).await?)
    }

    pub async fn list_decisions(&self, task_id: &Id) -> Result<Vec<DecisionRecord>> {
        Ok(self.storage.list_decisions(task_id).await?)
    }

    pub async fn list_quality_metrics(&self, task_id: &Id) -> Result<Vec<QualityMetric>> {
        Ok(self.storage.list_quality_metrics(task_id).await?)
    }

    pub async fn list_context_entries(&self, topic: Option<&str>) -> Result<Vec<ContextEntry>> {
        Ok(self.storage.list_context_entries(topic).await?)
    }

    pub async fn latest_checkpoint(&self, task_id: &Id) -> Result<Option<Checkpoint>> {
        Ok(self.storage.latest_checkpoint(task_id).await?)
    }

    /// Most recent `limit` observations for a critic, newest first.
    pub async fn get_critic_history(
        &self,
        critic_name: &str,
        origin: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CriticHistoryRecord>> {
        Ok(self
            .storage
            .critic_history(critic_name, origin, limit)
            .await?)
    }

    pub async fn critic_names(&self, origin: &str) -> Result<Vec<String>> {
        Ok(self.storage.critic_names(origin).await?)
    }

    // --- Audit appends (logged and skipped on failure) ---

    /// Append a standalone event. Failures are counted, never returned.
    pub async fn record_event(
        &self,
        task_id: Option<&Id>,
        agent: Option<&str>,
        payload: &EventPayload,
    ) {
        let event = match build_event(payload, task_id, agent) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "failed to serialize event payload, skipping");
                self.audit.inc_skipped_event();
                return;
            }
        };
        if let Err(e) = self.storage.append_event(&event).await {
            warn!(event_type = %event.event_type, error = %e, "event write failed, skipping");
            self.audit.inc_skipped_event();
        }
    }

    pub async fn record_decision(&self, decision: &DecisionRecord) {
        if let Err(e) = self.storage.insert_decision(decision).await {
            warn!(task_id = %decision.task_id, error = %e, "decision write failed, skipping");
            self.audit.inc_skipped_decision();
        }
        let payload = EventPayload::DecisionRecorded(DecisionRecordedPayload {
            decision_id: decision.id.clone(),
            consensus: decision.consensus,
            attempt: decision.attempt,
        });
        self.record_event(Some(&decision.task_id), None, &payload).await;
        self.bus.publish(StoreNotification::DecisionRecorded {
            task_id: decision.task_id.clone(),
            consensus: decision.consensus,
        });
    }

    pub async fn record_quality_metric(
        &self,
        task_id: &Id,
        dimension: &str,
        score: f64,
    ) -> QualityMetric {
        let metric = QualityMetric {
            task_id: task_id.clone(),
            dimension: dimension.to_string(),
            score,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.storage.insert_quality_metric(&metric).await {
            warn!(
                task_id = %task_id,
                dimension,
                error = %e,
                "quality metric write failed, skipping"
            );
            self.audit.inc_skipped_quality_metric();
        }
        metric
    }

    pub async fn add_context_entry(&self, entry: NewContextEntry) -> ContextEntry {
        let entry = ContextEntry {
            id: Id::new(),
            entry_type: entry.entry_type,
            topic: entry.topic,
            content: entry.content,
            related_tasks: entry.related_tasks,
            confidence: entry.confidence,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.storage.insert_context_entry(&entry).await {
            warn!(topic = %entry.topic, error = %e, "context entry write failed, skipping");
            self.audit.inc_skipped_context();
            return entry;
        }
        let payload = EventPayload::ContextAdded(ContextAddedPayload {
            entry_id: entry.id.clone(),
            topic: entry.topic.clone(),
        });
        let task_id = entry.related_tasks.first();
        self.record_event(task_id, None, &payload).await;
        entry
    }

    pub async fn create_checkpoint(&self, task_id: &Id, label: &str, state: Value) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: Id::new(),
            task_id: task_id.clone(),
            label: label.to_string(),
            state,
            created_at: Utc::now(),
        };
        if let Err(e) = self.storage.insert_checkpoint(&checkpoint).await {
            warn!(task_id = %task_id, label, error = %e, "checkpoint write failed, skipping");
            self.audit.inc_skipped_checkpoint();
            return checkpoint;
        }
        let payload = EventPayload::CheckpointCreated(CheckpointCreatedPayload {
            checkpoint_id: checkpoint.id.clone(),
            label: checkpoint.label.clone(),
        });
        self.record_event(Some(task_id), None, &payload).await;
        checkpoint
    }

    /// Append a critic observation and notify subscribers.
    pub async fn record_critic_result(
        &self,
        result: &CriticResult,
        origin: &str,
    ) -> CriticHistoryRecord {
        let metadata = serde_json::json!({
            "code": result.code,
            "failure": result.failure_context(),
        });
        let record = CriticHistoryRecord {
            critic_name: result.critic_name.clone(),
            passed: result.passed,
            timestamp: result.timestamp,
            origin: origin.to_string(),
            metadata,
        };
        if let Err(e) = self.storage.insert_critic_record(&record).await {
            warn!(critic = %record.critic_name, error = %e, "critic record write failed, skipping");
            self.audit.inc_skipped_critic_record();
        }
        self.bus.publish(StoreNotification::CriticResultRecorded {
            critic: record.critic_name.clone(),
            passed: record.passed,
            origin: record.origin.clone(),
        });
        record
    }

    // --- Per-task locks ---

    fn task_lock(&self, task_id: &Id) -> Arc<AsyncMutex<()>> {
        let mut locks = self.task_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(task_id.clone()).or_default())
    }

    fn release_task_lock(&self, task_id: &Id, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.task_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Held only by the map and this caller.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(task_id);
        }
    }
}

fn build_event(payload: &EventPayload, task_id: Option<&Id>, agent: Option<&str>) -> Result<Event> {
    let data = payload
        .to_value()
        .map_err(|e| StoreError::Storage(StorageError::Serialization(e)))?;
    Ok(Event {
        id: Id::new(),
        timestamp: Utc::now(),
        event_type: payload.event_type().as_str().to_string(),
        task_id: task_id.cloned(),
        agent: agent.map(str::to_string),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_core::{RemediationMetadata, Severity, TaskMetadata};
    use serde_json::json;
    use tempfile::TempDir;

    struct TestStore {
        store: Arc<TaskStore>,
        _dir: TempDir,
    }

    async fn create_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let store = TaskStore::new(
            Arc::new(storage),
            Arc::new(EventBus::new()),
            Arc::new(AuditMetrics::new()),
        );
        TestStore {
            store: Arc::new(store),
            _dir: dir,
        }
    }

    fn transition_events(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| e.event_type == "TASK_TRANSITIONED")
            .count()
    }

    #[tokio::test]
    async fn lifecycle_to_done_records_three_transitions() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T1", "feature")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        for (n, status) in [TaskStatus::InProgress, TaskStatus::NeedsReview, TaskStatus::Done]
            .into_iter()
            .enumerate()
        {
            let outcome = ts
                .store
                .transition(&task.id, status, None, &format!("t1-{n}"), Some("agent-a"))
                .await
                .unwrap();
            assert!(outcome.applied);
            assert_eq!(outcome.task.status, status);
        }

        let stored = ts.store.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert_eq!(stored.assigned_to.as_deref(), Some("agent-a"));
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());

        let events = ts.store.list_events(Some(&task.id)).await.unwrap();
        assert_eq!(transition_events(&events), 3);
    }

    #[tokio::test]
    async fn pickup_keeps_existing_assignee() {
        let ts = create_test_store().await;
        let task = ts
            .store
            .create_task(NewTask {
                assigned_to: Some("director".to_string()),
                ..NewTask::new("Review lint policy", "remediation")
            })
            .await
            .unwrap();

        let outcome = ts
            .store
            .transition(&task.id, TaskStatus::InProgress, None, "pickup", Some("worker-1"))
            .await
            .unwrap();
        assert_eq!(outcome.task.assigned_to.as_deref(), Some("director"));
    }

    #[tokio::test]
    async fn invalid_edge_leaves_task_unchanged() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();

        let err = ts
            .store
            .transition(&task.id, TaskStatus::Done, None, "skip-ahead", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Done,
                ..
            }
        ));

        let stored = ts.store.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        let events = ts.store.list_events(Some(&task.id)).await.unwrap();
        assert_eq!(transition_events(&events), 0);
    }

    #[tokio::test]
    async fn replayed_correlation_id_is_a_no_op() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();

        let first = ts
            .store
            .transition(&task.id, TaskStatus::InProgress, None, "assign-1", None)
            .await
            .unwrap();
        assert!(first.applied);

        // Replays succeed even though pending -> in_progress is no longer legal.
        let replay = ts
            .store
            .transition(&task.id, TaskStatus::InProgress, None, "assign-1", None)
            .await
            .unwrap();
        assert!(!replay.applied);
        assert_eq!(replay.task.status, TaskStatus::InProgress);

        let events = ts.store.list_events(Some(&task.id)).await.unwrap();
        assert_eq!(transition_events(&events), 1);
    }

    #[tokio::test]
    async fn concurrent_transitions_apply_once() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..4 {
            let store = Arc::clone(&ts.store);
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(&id, TaskStatus::InProgress, None, &format!("race-{n}"), None)
                    .await
            }));
        }

        let mut applied = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) if outcome.applied => applied += 1,
                Err(StoreError::InvalidTransition { .. }) => rejected += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(rejected, 3);
    }

    #[tokio::test]
    async fn metadata_patch_merges_and_rejects_invalid() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();

        let patch = json!({"ticket": "OPS-7"});
        let outcome = ts
            .store
            .transition(
                &task.id,
                TaskStatus::Blocked,
                patch.as_object(),
                "block-1",
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.task.metadata.extra.get("ticket"), Some(&json!("OPS-7")));

        let bad = json!({"lane": 12});
        let err = ts
            .store
            .transition(&task.id, TaskStatus::Pending, bad.as_object(), "unblock-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidMetadata(_)));
        assert_eq!(
            ts.store.get_task(&task.id).await.unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[tokio::test]
    async fn ready_tasks_wait_for_dependencies() {
        let ts = create_test_store().await;
        let first = ts.store.create_task(NewTask::new("first", "feature")).await.unwrap();
        let second = ts
            .store
            .create_task(NewTask::new("second", "feature").with_dependency(first.id.clone()))
            .await
            .unwrap();

        let ready: Vec<Id> = ts
            .store
            .get_ready_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![first.id.clone()]);

        ts.store
            .drive_to_done(&first.id, "agent", "shipped", "finish-first")
            .await
            .unwrap();
        let ready: Vec<Id> = ts
            .store
            .get_ready_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![second.id]);
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let ts = create_test_store().await;
        let result = ts
            .store
            .create_task(NewTask::new("x", "feature").with_dependency(Id::new()))
            .await;
        assert!(matches!(result, Err(StoreError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn roadmap_health_is_cached_until_next_write() {
        let ts = create_test_store().await;
        ts.store.create_task(NewTask::new("a", "feature")).await.unwrap();

        let before = ts.store.version();
        let health = ts.store.get_roadmap_health().await.unwrap();
        assert_eq!(health.total, 1);
        assert_eq!(health.count(TaskStatus::Pending), 1);
        assert_eq!(ts.store.version(), before);

        ts.store.create_task(NewTask::new("b", "feature")).await.unwrap();
        assert!(ts.store.version() > before);
        let health = ts.store.get_roadmap_health().await.unwrap();
        assert_eq!(health.total, 2);
    }

    #[tokio::test]
    async fn revision_requires_done_source() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("orig", "feature")).await.unwrap();

        let err = ts
            .store
            .create_revision(&task.id, NewTask::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotTerminal { .. }));

        ts.store
            .drive_to_done(&task.id, "agent", "done", "orig-done")
            .await
            .unwrap();
        let revision = ts
            .store
            .create_revision(&task.id, NewTask::default())
            .await
            .unwrap();
        assert_eq!(revision.metadata.revision_of, Some(task.id.clone()));
        assert_eq!(revision.title, "Revision: orig");
        assert_eq!(
            ts.store.get_task(&task.id).await.unwrap().status,
            TaskStatus::Done
        );
    }

    #[tokio::test]
    async fn second_open_remediation_for_same_critic_is_rejected() {
        let ts = create_test_store().await;
        let meta = TaskMetadata::remediation(RemediationMetadata::for_critic(
            "build",
            Severity::Autopilot,
        ));
        let new = NewTask::new("fix build critic", "remediation").with_metadata(meta.clone());
        ts.store.create_task(new).await.unwrap();

        let err = ts
            .store
            .create_task(NewTask::new("again", "remediation").with_metadata(meta))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRemediation(_)));
        assert!(ts.store.find_open_remediation("critic:build").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn amend_updates_description_and_rejects_done_tasks() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();

        let patch = json!({"note": "seen twice"});
        let outcome = ts
            .store
            .amend(&task.id, patch.as_object().unwrap(), Some("updated"), "amend-1")
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.task.description, "updated");
        assert_eq!(outcome.task.status, TaskStatus::Pending);

        ts.store.drive_to_done(&task.id, "a", "ok", "done-1").await.unwrap();
        let err = ts
            .store
            .amend(&task.id, patch.as_object().unwrap(), None, "amend-2")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed(_)));
    }

    #[tokio::test]
    async fn transitions_publish_notifications() {
        let ts = create_test_store().await;
        let mut sub = ts.store.bus().subscribe();
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();
        ts.store
            .transition(&task.id, TaskStatus::InProgress, None, "n-1", None)
            .await
            .unwrap();

        assert_eq!(
            sub.receiver.recv().await.unwrap(),
            StoreNotification::TaskCreated {
                task_id: task.id.clone()
            }
        );
        assert_eq!(
            sub.receiver.recv().await.unwrap(),
            StoreNotification::TaskTransitioned {
                task_id: task.id.clone(),
                from: TaskStatus::Pending,
                to: TaskStatus::InProgress,
            }
        );
        assert!(ts.store.bus().unsubscribe(sub.id));
    }

    #[tokio::test]
    async fn audit_appends_are_readable() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();

        ts.store.record_quality_metric(&task.id, "coverage", 0.82).await;
        ts.store
            .add_context_entry(NewContextEntry {
                entry_type: ContextEntryType::Learning,
                topic: "flaky-tests".to_string(),
                content: "retry masks ordering bugs".to_string(),
                related_tasks: vec![task.id.clone()],
                confidence: Some(0.7),
            })
            .await;
        ts.store
            .create_checkpoint(&task.id, "pre-merge", json!({"sha": "abc"}))
            .await;

        assert_eq!(ts.store.list_quality_metrics(&task.id).await.unwrap().len(), 1);
        assert_eq!(
            ts.store
                .list_context_entries(Some("flaky-tests"))
                .await
                .unwrap()
                .len(),
            1
        );
        let checkpoint = ts.store.latest_checkpoint(&task.id).await.unwrap().unwrap();
        assert_eq!(checkpoint.label, "pre-merge");
        assert_eq!(ts.store.audit().total_skipped(), 0);
    }

    #[tokio::test]
    async fn failed_audit_writes_are_counted_and_skipped() {
        let ts = create_test_store().await;
        let task = ts.store.create_task(NewTask::new("T", "bug")).await.unwrap();

        for table in ["checkpoints", "decisions", "context_entries"] {
            sqlx::query(&format!("DROP TABLE {table}"))
                .execute(ts.store.storage().pool())
                .await
                .unwrap();
        }

        let checkpoint = ts
            .store
            .create_checkpoint(&task.id, "pre-merge", json!({"sha": "abc"}))
            .await;
        assert_eq!(checkpoint.label, "pre-merge");

        let decision = DecisionRecord {
            id: Id::new(),
            task_id: task.id.clone(),
            gate_name: "post_execution".to_string(),
            verdicts: std::collections::BTreeMap::from([("automated".to_string(), true)]),
            consensus: true,
            reasoning: String::new(),
            attempt: 1,
            evidence_digest: None,
            timestamp: Utc::now(),
        };
        ts.store.record_decision(&decision).await;

        ts.store
            .add_context_entry(NewContextEntry {
                entry_type: ContextEntryType::Learning,
                topic: "flaky-tests".to_string(),
                content: "retry masks ordering bugs".to_string(),
                related_tasks: vec![task.id.clone()],
                confidence: None,
            })
            .await;

        let snapshot = ts.store.audit().snapshot();
        assert_eq!(snapshot.skipped_checkpoints, 1);
        assert_eq!(snapshot.skipped_decisions, 1);
        assert_eq!(snapshot.skipped_context, 1);
        assert_eq!(snapshot.skipped_events, 0);

        let outcome = ts
            .store
            .transition(&task.id, TaskStatus::InProgress, None, "assign:T:1", Some("agent"))
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.task.status, TaskStatus::InProgress);
    }
}
