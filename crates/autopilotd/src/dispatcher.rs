//! Dispatch loop: turns scheduler batches into leased agent executions.
//!
//! A tick refreshes candidates from the store in one pass, pulls a batch,
//! reserves and leases each task, and spawns the executor without waiting
//! for it. Completions come back over a channel. The lease guard travels
//! with the completion, so the lease is released on every exit path
//! including executor panics. Ticks may overlap; reservations keep a task
//! from being claimed twice.
//!
//! Tasks in `needs_review` go to the critical lane. Their run only gathers
//! evidence: the task is not moved back to `in_progress`, and the report is
//! handed straight to the quality gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use autopilot_core::{Escalation, Id, Task, TaskStatus};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{AgentExecutor, ExecutionReport, ExecutorError};
use crate::lease::{Lease, LeaseGuard, LeaseManager};
use crate::notify::{StoreNotification, Subscription};
use crate::quality_gate::{GateError, QualityGate};
use crate::scheduler::{CancelOutcome, DispatchInput, ExpiryOutcome, Scheduler, SchedulerError};
use crate::store::{StoreError, TaskStore};

pub const DEFAULT_HOLDER: &str = "autopilotd";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("quality gate error: {0}")]
    Gate(#[from] GateError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Summary of one dispatch tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub enqueued: usize,
    pub dispatched: Vec<Id>,
    /// Claimed tasks that could not be leased this tick.
    pub deferred: Vec<Id>,
}

/// Outcome of one execution, sent back to the dispatcher.
#[derive(Debug)]
pub struct Completion {
    pub task: Task,
    pub lease: LeaseGuard,
    pub result: std::result::Result<ExecutionReport, ExecutorError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Approved,
    Rejected,
    Incident,
    Blocked,
    Retrying,
    Cancelled,
    /// The run was reaped or cancelled before it reported back.
    Stale,
}

/// Store changes that can produce new dispatch candidates.
fn wakes_dispatcher(notification: &StoreNotification) -> bool {
    match notification {
        StoreNotification::TaskCreated { .. } => true,
        StoreNotification::TaskTransitioned { to, .. } => matches!(
            to,
            TaskStatus::Pending
                | TaskStatus::NeedsReview
                | TaskStatus::NeedsImprovement
                | TaskStatus::Done
        ),
        _ => false,
    }
}

pub struct Dispatcher {
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
    leases: Arc<LeaseManager>,
    gate: Arc<QualityGate>,
    executor: Arc<dyn AgentExecutor>,
    holder: String,
    /// Assignees worked by people, never by the executor.
    reserved_roles: Vec<String>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Completion>>,
    running: Mutex<HashMap<Id, CancellationToken>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        scheduler: Arc<Scheduler>,
        leases: Arc<LeaseManager>,
        gate: Arc<QualityGate>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            store,
            scheduler,
            leases,
            gate,
            executor,
            holder: DEFAULT_HOLDER.to_string(),
            reserved_roles: Vec::new(),
            completions_tx,
            completions_rx: tokio::sync::Mutex::new(completions_rx),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Skip tasks assigned to any of `roles`.
    #[must_use]
    pub fn with_reserved_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.reserved_roles = roles.into_iter().collect();
        self
    }

    fn running(&self) -> MutexGuard<'_, HashMap<Id, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_reserved(&self, task: &Task) -> bool {
        task.assigned_to
            .as_ref()
            .is_some_and(|assignee| self.reserved_roles.contains(assignee))
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    /// Enqueue in-progress tasks left without a lease by a previous process.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let mut recovered = 0;
        for task in self.store.list_tasks(Some(TaskStatus::InProgress)).await? {
            if self.leases.is_leased(&task.id) || self.is_reserved(&task) {
                continue;
            }
            let input = DispatchInput {
                lane: task.metadata.lane,
                ..DispatchInput::new(task.id.clone())
            };
            if self.scheduler.dispatch_task(&input).is_ok() {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "requeued orphaned in-progress tasks");
        }
        Ok(recovered)
    }

    /// Refresh candidates, then lease and start as many tasks as the caps allow.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let candidates = self.store.scheduling_candidates().await?;
        let reviews = candidates.needs_review.iter().map(|t| (t, true));
        let rest = candidates
            .needs_improvement
            .iter()
            .chain(candidates.ready.iter())
            .map(|t| (t, false));
        for (task, review) in reviews.chain(rest) {
            if self.is_reserved(task)
                || self.scheduler.is_scheduled(&task.id)
                || self.leases.is_leased(&task.id)
            {
                continue;
            }
            let input = DispatchInput {
                critical: review,
                lane: task.metadata.lane,
                ..DispatchInput::new(task.id.clone())
            };
            if self.scheduler.dispatch_task(&input).is_ok() {
                report.enqueued += 1;
            }
        }

        // A cancelled run gives up its slot before its lease is dropped.
        let capacity = self
            .scheduler
            .settings()
            .global_cap
            .saturating_sub(self.leases.occupied_count());
        let batch = self.scheduler.get_next_batch(capacity);
        for scheduled in batch {
            let task_id = scheduled.task_id;
            let guard = match self
                .leases
                .reserve(&task_id)
                .and_then(|reservation| reservation.acquire(&self.holder, None))
            {
                Ok(guard) => guard,
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "lease unavailable, retrying next tick");
                    if let Err(e) = self.scheduler.return_claim(&task_id) {
                        warn!(task_id = %task_id, error = %e, "failed to return claim");
                    }
                    report.deferred.push(task_id);
                    continue;
                }
            };

            match self.prepare(&task_id, guard.lease()).await {
                Ok(Some(task)) => {
                    if self.scheduler.start_task(&task_id).is_err() {
                        debug!(task_id = %task_id, "task cancelled during dispatch");
                        continue;
                    }
                    self.spawn_execution(task, guard);
                    report.dispatched.push(task_id);
                }
                Ok(None) => {
                    self.scheduler.drop_claim(&task_id);
                }
                Err(e) => {
                    self.scheduler.drop_claim(&task_id);
                    return Err(e);
                }
            }
        }

        if !report.dispatched.is_empty() {
            info!(
                dispatched = report.dispatched.len(),
                running = self.scheduler.running_count(),
                "dispatch tick"
            );
        }
        Ok(report)
    }

    /// Move a leased task into `in_progress` if needed. Returns `None` when
    /// the task is no longer dispatchable.
    async fn prepare(&self, task_id: &Id, lease: &Lease) -> Result<Option<Task>> {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(StoreError::TaskNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match task.status {
            TaskStatus::Pending | TaskStatus::NeedsImprovement => {
                let correlation_id = format!(
                    "dispatch:{task_id}:{}",
                    lease.acquired_at.timestamp_millis()
                );
                match self
                    .store
                    .transition(
                        task_id,
                        TaskStatus::InProgress,
                        None,
                        &correlation_id,
                        Some(&self.holder),
                    )
                    .await
                {
                    Ok(outcome) => Ok(Some(outcome.task)),
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        debug!(task_id = %task_id, status = %from, "task moved before dispatch");
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            TaskStatus::InProgress | TaskStatus::NeedsReview => Ok(Some(task)),
            TaskStatus::Blocked | TaskStatus::Done => Ok(None),
        }
    }

    fn spawn_execution(&self, task: Task, lease: LeaseGuard) {
        let cancel = CancellationToken::new();
        self.running().insert(task.id.clone(), cancel.clone());

        let executor = Arc::clone(&self.executor);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let exec_task = task.clone();
            let handle = tokio::spawn(async move { executor.execute(&exec_task, cancel).await });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ExecutorError::Io(std::io::Error::other(format!(
                    "executor task failed: {e}"
                )))),
            };
            let task_id = task.id.clone();
            if tx.send(Completion { task, lease, result }).is_err() {
                warn!(task_id = %task_id, "dispatcher gone, dropping completion");
            }
        });
    }

    /// Settle one finished execution. The lease is released when the
    /// completion is dropped at the end of this call.
    pub async fn handle_completion(&self, completion: Completion) -> Result<CompletionOutcome> {
        let Completion { task, lease, result } = completion;
        let task_id = task.id.clone();

        if self.running().remove(&task_id).is_none() {
            info!(task_id = %task_id, "ignoring completion for reaped or cancelled run");
            return Ok(CompletionOutcome::Stale);
        }

        let outcome = match result {
            Ok(report) if report.completed => {
                self.submit_for_review(&task_id, lease.lease(), &report)
                    .await
            }
            Ok(report) => {
                self.block_task(&task_id, "agent_gave_up", &report.evidence.summary)
                    .await?;
                let _ = self.scheduler.complete_task(&task_id);
                Ok(CompletionOutcome::Blocked)
            }
            Err(ExecutorError::Cancelled) => {
                self.scheduler.cancel_task(&task_id);
                Ok(CompletionOutcome::Cancelled)
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "agent execution failed");
                match self.scheduler.handle_lease_expired(lease.lease()).await? {
                    ExpiryOutcome::Escalated { .. } => Ok(CompletionOutcome::Blocked),
                    _ => Ok(CompletionOutcome::Retrying),
                }
            }
        };
        drop(lease);
        outcome
    }

    async fn submit_for_review(
        &self,
        task_id: &Id,
        lease: &Lease,
        report: &ExecutionReport,
    ) -> Result<CompletionOutcome> {
        let current = self.store.get_task(task_id).await?;
        if current.status == TaskStatus::InProgress {
            let correlation_id = format!(
                "submit:{task_id}:{}",
                lease.acquired_at.timestamp_millis()
            );
            self.store
                .transition(
                    task_id,
                    TaskStatus::NeedsReview,
                    None,
                    &correlation_id,
                    Some(&lease.holder),
                )
                .await?;
        }
        let _ = self.scheduler.complete_task(task_id);

        match self.gate.verify(task_id, &report.evidence).await {
            Ok(verification) if verification.incident.is_some() => Ok(CompletionOutcome::Incident),
            Ok(verification) if verification.decision.consensus => Ok(CompletionOutcome::Approved),
            Ok(_) => Ok(CompletionOutcome::Rejected),
            Err(GateError::IncidentOpen(_)) => {
                warn!(task_id = %task_id, "verification skipped: incident open");
                Ok(CompletionOutcome::Incident)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn block_task(&self, task_id: &Id, reason: &str, note: &str) -> Result<()> {
        let escalation = Escalation {
            reason: reason.to_string(),
            note: note.to_string(),
            count: 1,
            at: chrono::Utc::now(),
        };
        let mut patch = Map::new();
        patch.insert(
            "escalation".to_string(),
            serde_json::to_value(&escalation).unwrap_or(Value::Null),
        );
        let correlation_id = format!("{reason}:{task_id}:{}", Id::new());
        match self
            .store
            .transition(
                task_id,
                TaskStatus::Blocked,
                Some(&patch),
                &correlation_id,
                Some(&self.holder),
            )
            .await
        {
            Ok(_) | Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel a queued or running task; it ends up `blocked`. Running
    /// executors are signalled. Their slot is freed at once, but the lease
    /// counts against the global cap until the run reports back or the TTL
    /// reaps it.
    pub async fn cancel(&self, task_id: &Id) -> Result<CancelOutcome> {
        let outcome = self.scheduler.cancel(task_id, &self.holder).await?;
        if let Some(token) = self.running().remove(task_id) {
            token.cancel();
        }
        Ok(outcome)
    }

    /// Reclaim expired leases, signal their executors and requeue or escalate.
    pub async fn reap_expired(&self) -> Vec<(Id, ExpiryOutcome)> {
        let mut outcomes = Vec::new();
        for lease in self.leases.reap_expired() {
            if let Some(token) = self.running().remove(&lease.task_id) {
                token.cancel();
            }
            match self.scheduler.handle_lease_expired(&lease).await {
                Ok(outcome) => outcomes.push((lease.task_id.clone(), outcome)),
                Err(e) => {
                    error!(task_id = %lease.task_id, error = %e, "failed to handle lease expiry");
                }
            }
        }
        outcomes
    }

    /// Wait for and settle the next completion.
    pub async fn next_completion(&self) -> Option<Result<CompletionOutcome>> {
        let completion = self.completions_rx.lock().await.recv().await?;
        Some(self.handle_completion(completion).await)
    }

    async fn run_tick(&self) {
        if let Err(e) = self.tick().await {
            error!(error = %e, "dispatch tick failed");
        }
    }

    /// Run ticks, completions and lease reaping until `cancel` fires. Store
    /// notifications that can produce candidates trigger an immediate tick;
    /// the interval tick is the fallback. The subscription is removed on exit.
    pub async fn run(
        self: Arc<Self>,
        mut subscription: Subscription,
        tick_interval: Duration,
        reaper_interval: Duration,
        cancel: CancellationToken,
    ) {
        info!("dispatcher started");
        if let Err(e) = self.recover_orphans().await {
            warn!(error = %e, "orphan recovery failed");
        }
        let mut ticks = tokio::time::interval(tick_interval);
        let mut reaper = tokio::time::interval(reaper_interval);
        let mut completions = self.completions_rx.lock().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticks.tick() => self.run_tick().await,
                _ = reaper.tick() => {
                    let reaped = self.reap_expired().await;
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "reaped expired leases");
                    }
                }
                Some(completion) = completions.recv() => {
                    match self.handle_completion(completion).await {
                        Ok(outcome) => debug!(?outcome, "completion handled"),
                        Err(e) => error!(error = %e, "completion handling failed"),
                    }
                }
                notification = subscription.receiver.recv() => {
                    let Some(notification) = notification else {
                        break;
                    };
                    // Coalesce a burst of writes into one tick.
                    let mut wake = wakes_dispatcher(&notification);
                    while let Ok(next) = subscription.receiver.try_recv() {
                        wake |= wakes_dispatcher(&next);
                    }
                    if wake {
                        self.run_tick().await;
                    }
                }
            }
        }
        self.store.bus().unsubscribe(subscription.id);
        for token in self.running().values() {
            token.cancel();
        }
        info!("dispatcher stopped");
    }
}
