//! Priority scheduler for the control-plane daemon.
//!
//! Tasks wait in one FIFO queue per lane. `get_next_batch` claims concurrency
//! slots as it pulls, so the number of occupied slots never exceeds the global
//! cap, even while a claimed task is still being leased. A lower lane that has
//! waited through `starvation_window` consecutive higher-lane picks gets the
//! next slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use autopilot_core::events::{EventPayload, LeaseExpiredPayload, TaskEscalatedPayload};
use autopilot_core::{Config, Escalation, Id, Lane, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::lease::Lease;
use crate::store::{StoreError, TaskStore};

/// Escalation reason recorded when a task is cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("task {0} is already queued or running")]
    AlreadyScheduled(String),
    #[error("task {0} does not hold a scheduler slot")]
    NoSlot(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler limits, copied out of `Config`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub global_cap: usize,
    pub lane_caps: [usize; 3],
    pub starvation_window: u32,
    pub default_lane: Lane,
    pub max_lease_expiries: u32,
    pub expiry_backoff_base_sec: u64,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            global_cap: config.global_cap,
            lane_caps: Lane::ALL.map(|lane| config.lane_cap(lane)),
            starvation_window: config.starvation_window,
            default_lane: config.default_lane,
            max_lease_expiries: config.max_lease_expiries,
            expiry_backoff_base_sec: config.expiry_backoff_base_sec,
        }
    }

    fn cap(&self, lane: Lane) -> usize {
        self.lane_caps[lane.index()]
    }

    /// `base * 2^(expiries - 1)` seconds.
    pub fn backoff_for(&self, expiries: u32) -> u64 {
        let exponent = expiries.saturating_sub(1).min(32);
        self.expiry_backoff_base_sec
            .saturating_mul(1_u64 << exponent)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Request to schedule a task. Explicit flags override `lane`, which
/// overrides the configured default.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
pub struct DispatchInput {
    pub task_id: Id,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub lane: Option<Lane>,
}

impl DispatchInput {
    pub fn new(task_id: Id) -> Self {
        Self {
            task_id,
            ..Self::default()
        }
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    task_id: Id,
    not_before: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    lane: Lane,
    claimed_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

/// A task pulled from its lane; it holds a slot until completed, cancelled
/// or returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub task_id: Id,
    pub lane: Lane,
    pub expiries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from its lane before it was leased.
    Dequeued,
    /// Was running; its slot is freed and the executor should be signalled.
    Released,
    NotScheduled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    Requeued { retry_after_sec: u64, expiries: u32 },
    Escalated { expiries: u32 },
    /// The task finished or vanished before the lease was reaped.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default)]
struct LaneStats {
    completed: u64,
    cancelled: u64,
    total_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneSnapshot {
    pub lane: Lane,
    pub queued: usize,
    pub running: usize,
    pub cap: usize,
    pub completed: u64,
    pub cancelled: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub global_cap: usize,
    pub running: usize,
    pub lanes: Vec<LaneSnapshot>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    lanes: [VecDeque<QueueEntry>; 3],
    queued: HashMap<Id, Lane>,
    running: HashMap<Id, Slot>,
    expiries: HashMap<Id, u32>,
    /// Consecutive higher-lane picks while each lane had an eligible entry.
    passed_over: [u32; 3],
    stats: [LaneStats; 3],
}

impl SchedulerState {
    fn running_in(&self, lane: Lane) -> usize {
        self.running.values().filter(|s| s.lane == lane).count()
    }

    fn has_eligible(&self, lane: Lane, now: DateTime<Utc>) -> bool {
        self.lanes[lane.index()].iter().any(|e| e.is_eligible(now))
    }

    fn take_eligible(&mut self, lane: Lane, now: DateTime<Utc>) -> Option<QueueEntry> {
        let queue = &mut self.lanes[lane.index()];
        let position = queue.iter().position(|e| e.is_eligible(now))?;
        queue.remove(position)
    }

    fn remove_queued(&mut self, task_id: &Id) -> bool {
        let Some(lane) = self.queued.remove(task_id) else {
            return false;
        };
        self.lanes[lane.index()].retain(|e| &e.task_id != task_id);
        true
    }
}

pub struct Scheduler {
    store: Arc<TaskStore>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, clock: Arc<dyn Clock>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn classify(&self, input: &DispatchInput) -> Lane {
        if input.interactive {
            Lane::Interactive
        } else if input.critical {
            Lane::Critical
        } else {
            input.lane.unwrap_or(self.settings.default_lane)
        }
    }

    /// Classify a task into a lane and enqueue it.
    pub fn dispatch_task(&self, input: &DispatchInput) -> Result<Lane> {
        let lane = self.classify(input);
        let mut state = self.state();
        if state.queued.contains_key(&input.task_id) || state.running.contains_key(&input.task_id) {
            return Err(SchedulerError::AlreadyScheduled(input.task_id.to_string()));
        }
        state.queued.insert(input.task_id.clone(), lane);
        state.lanes[lane.index()].push_back(QueueEntry {
            task_id: input.task_id.clone(),
            not_before: None,
        });
        Ok(lane)
    }

    pub fn is_scheduled(&self, task_id: &Id) -> bool {
        let state = self.state();
        state.queued.contains_key(task_id) || state.running.contains_key(task_id)
    }

    /// Pull up to `max_tasks` eligible tasks, highest lane first, claiming a
    /// slot for each.
    pub fn get_next_batch(&self, max_tasks: usize) -> Vec<ScheduledTask> {
        let now = self.clock.now();
        let mut state = self.state();
        let mut batch = Vec::new();

        while batch.len() < max_tasks && state.running.len() < self.settings.global_cap {
            let open: Vec<Lane> = Lane::ALL
                .into_iter()
                .filter(|lane| {
                    state.running_in(*lane) < self.settings.cap(*lane)
                        && state.has_eligible(*lane, now)
                })
                .collect();
            let window = self.settings.starvation_window;
            let starved = open
                .iter()
                .copied()
                .find(|lane| window > 0 && state.passed_over[lane.index()] >= window);
            let Some(lane) = starved.or_else(|| open.first().copied()) else {
                break;
            };
            let Some(entry) = state.take_eligible(lane, now) else {
                break;
            };

            state.passed_over[lane.index()] = 0;
            for waiting in open.iter().filter(|l| l.index() > lane.index()) {
                state.passed_over[waiting.index()] += 1;
            }

            state.queued.remove(&entry.task_id);
            state.running.insert(
                entry.task_id.clone(),
                Slot {
                    lane,
                    claimed_at: now,
                    started_at: None,
                },
            );
            let expiries = state.expiries.get(&entry.task_id).copied().unwrap_or(0);
            batch.push(ScheduledTask {
                task_id: entry.task_id,
                lane,
                expiries,
            });
        }
        batch
    }

    /// Put a claimed task back at the front of its lane without counting it
    /// as completed. Used when leasing fails after the claim.
    pub fn return_claim(&self, task_id: &Id) -> Result<()> {
        let mut state = self.state();
        let slot = state
            .running
            .remove(task_id)
            .ok_or_else(|| SchedulerError::NoSlot(task_id.to_string()))?;
        state.queued.insert(task_id.clone(), slot.lane);
        state.lanes[slot.lane.index()].push_front(QueueEntry {
            task_id: task_id.clone(),
            not_before: None,
        });
        Ok(())
    }

    /// Free a claimed slot and forget the task.
    pub fn drop_claim(&self, task_id: &Id) -> bool {
        self.state().running.remove(task_id).is_some()
    }

    pub fn start_task(&self, task_id: &Id) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state();
        let slot = state
            .running
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NoSlot(task_id.to_string()))?;
        slot.started_at = Some(now);
        Ok(())
    }

    /// Release the slot and record the run duration. Returns the duration.
    pub fn complete_task(&self, task_id: &Id) -> Result<Duration> {
        let now = self.clock.now();
        let mut state = self.state();
        let slot = state
            .running
            .remove(task_id)
            .ok_or_else(|| SchedulerError::NoSlot(task_id.to_string()))?;
        state.expiries.remove(task_id);
        let elapsed = now - slot.started_at.unwrap_or(slot.claimed_at);
        let stats = &mut state.stats[slot.lane.index()];
        stats.completed += 1;
        stats.total_duration_ms += u64::try_from(elapsed.num_milliseconds()).unwrap_or(0);
        Ok(elapsed)
    }

    pub fn cancel_task(&self, task_id: &Id) -> CancelOutcome {
        let mut state = self.state();
        if state.remove_queued(task_id) {
            state.expiries.remove(task_id);
            return CancelOutcome::Dequeued;
        }
        match state.running.remove(task_id) {
            Some(slot) => {
                state.expiries.remove(task_id);
                state.stats[slot.lane.index()].cancelled += 1;
                CancelOutcome::Released
            }
            None => CancelOutcome::NotScheduled,
        }
    }

    /// Cancel a task for good: move it to `blocked` with a `cancelled`
    /// escalation, then free its lane entry or slot. Blocking first keeps a
    /// concurrent tick from re-enqueueing it; only an unblock makes it
    /// dispatchable again. Running executors are signalled by the caller.
    pub async fn cancel(&self, task_id: &Id, agent: &str) -> Result<CancelOutcome> {
        let task = self.store.get_task(task_id).await?;
        if !task.status.is_terminal() && task.status != TaskStatus::Blocked {
            let escalation = Escalation {
                reason: CANCELLED_REASON.to_string(),
                note: format!("cancelled by {agent} while {}", task.status),
                count: 1,
                at: self.clock.now(),
            };
            let mut patch = Map::new();
            patch.insert(
                "escalation".to_string(),
                serde_json::to_value(&escalation).unwrap_or(Value::Null),
            );
            let correlation_id = format!("cancel:{task_id}:{}", Id::new());
            match self
                .store
                .transition(
                    task_id,
                    TaskStatus::Blocked,
                    Some(&patch),
                    &correlation_id,
                    Some(agent),
                )
                .await
            {
                Ok(_) => {}
                Err(StoreError::InvalidTransition { from, .. }) => {
                    debug!(task_id = %task_id, status = %from, "task settled before cancel");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let outcome = self.cancel_task(task_id);
        info!(task_id = %task_id, ?outcome, "task cancelled");
        Ok(outcome)
    }

    /// Requeue a task whose lease expired with exponential backoff, or move it
    /// to `blocked` once it has expired more than `max_lease_expiries` times.
    pub async fn handle_lease_expired(&self, lease: &Lease) -> Result<ExpiryOutcome> {
        let now = self.clock.now();
        let task_id = &lease.task_id;

        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(StoreError::TaskNotFound(_)) => {
                self.cancel_task(task_id);
                return Ok(ExpiryOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        };
        if task.status.is_terminal() || task.status == TaskStatus::Blocked {
            self.cancel_task(task_id);
            return Ok(ExpiryOutcome::Dropped);
        }

        let (expiries, lane) = {
            let mut state = self.state();
            let lane = match state.running.remove(task_id) {
                Some(slot) => slot.lane,
                None => {
                    state.remove_queued(task_id);
                    task.metadata.lane.unwrap_or(self.settings.default_lane)
                }
            };
            let expiries = state.expiries.entry(task_id.clone()).or_insert(0);
            *expiries += 1;
            (*expiries, lane)
        };

        if expiries > self.settings.max_lease_expiries {
            self.escalate(lease, expiries).await?;
            self.state().expiries.remove(task_id);
            return Ok(ExpiryOutcome::Escalated { expiries });
        }

        let retry_after_sec = self.settings.backoff_for(expiries);
        let backoff = i64::try_from(retry_after_sec).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        let not_before = now + Duration::seconds(backoff);
        {
            let mut state = self.state();
            state.queued.insert(task_id.clone(), lane);
            state.lanes[lane.index()].push_back(QueueEntry {
                task_id: task_id.clone(),
                not_before: Some(not_before),
            });
        }
        info!(task_id = %task_id, expiries, retry_after_sec, "lease expired, task requeued");
        self.store
            .record_event(
                Some(task_id),
                Some(&lease.holder),
                &EventPayload::LeaseExpired(LeaseExpiredPayload {
                    holder: lease.holder.clone(),
                    expiries,
                    retry_after_sec: Some(retry_after_sec),
                }),
            )
            .await;
        Ok(ExpiryOutcome::Requeued {
            retry_after_sec,
            expiries,
        })
    }

    async fn escalate(&self, lease: &Lease, expiries: u32) -> Result<()> {
        let task_id = &lease.task_id;
        let escalation = Escalation {
            reason: "lease_expired".to_string(),
            note: format!(
                "lease expired {expiries} times (last holder {}); automatic retries stopped",
                lease.holder
            ),
            count: expiries,
            at: self.clock.now(),
        };
        let mut patch = Map::new();
        patch.insert(
            "escalation".to_string(),
            serde_json::to_value(&escalation).unwrap_or(Value::Null),
        );
        let correlation_id = format!(
            "lease-expired:{task_id}:{}",
            lease.acquired_at.timestamp_millis()
        );

        self.store
            .record_event(
                Some(task_id),
                Some(&lease.holder),
                &EventPayload::LeaseExpired(LeaseExpiredPayload {
                    holder: lease.holder.clone(),
                    expiries,
                    retry_after_sec: None,
                }),
            )
            .await;
        match self
            .store
            .transition(task_id, TaskStatus::Blocked, Some(&patch), &correlation_id, None)
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                warn!(task_id = %task_id, status = %from, "cannot block task after lease expiries");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.store
            .record_event(
                Some(task_id),
                None,
                &EventPayload::TaskEscalated(TaskEscalatedPayload {
                    reason: escalation.reason.clone(),
                    count: expiries,
                }),
            )
            .await;
        warn!(task_id = %task_id, expiries, "task escalated after repeated lease expiry");
        Ok(())
    }

    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state().queued.len()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state();
        let lanes = Lane::ALL
            .into_iter()
            .map(|lane| {
                let stats = state.stats[lane.index()];
                LaneSnapshot {
                    lane,
                    queued: state.lanes[lane.index()].len(),
                    running: state.running_in(lane),
                    cap: self.settings.cap(lane),
                    completed: stats.completed,
                    cancelled: stats.cancelled,
                    total_duration_ms: stats.total_duration_ms,
                    avg_duration_ms: (stats.completed > 0)
                        .then(|| stats.total_duration_ms / stats.completed),
                }
            })
            .collect();
        SchedulerSnapshot {
            global_cap: self.settings.global_cap,
            running: state.running.len(),
            lanes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::AuditMetrics;
    use crate::notify::EventBus;
    use crate::storage::Storage;
    use autopilot_core::NewTask;
    use tempfile::TempDir;

    struct TestScheduler {
        scheduler: Scheduler,
        store: Arc<TaskStore>,
        clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    async fn create_test_scheduler(settings: SchedulerSettings) -> TestScheduler {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let store = Arc::new(TaskStore::new(
            Arc::new(storage),
            Arc::new(EventBus::new()),
            Arc::new(AuditMetrics::new()),
        ));
        let clock = Arc::new(ManualClock::default());
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            settings,
        );
        TestScheduler {
            scheduler,
            store,
            clock,
            _dir: dir,
        }
    }

    fn settings(global_cap: usize, lane_cap: usize) -> SchedulerSettings {
        SchedulerSettings {
            global_cap,
            lane_caps: [lane_cap; 3],
            ..SchedulerSettings::default()
        }
    }

    fn enqueue(scheduler: &Scheduler, name: &str, lane: Lane) -> Id {
        let id = Id::from_string(name);
        scheduler
            .dispatch_task(&DispatchInput::new(id.clone()).with_lane(lane))
            .unwrap();
        id
    }

    #[tokio::test]
    async fn flags_override_lane() {
        let ts = create_test_scheduler(SchedulerSettings::default()).await;
        let mut input = DispatchInput::new(Id::from_string("t")).with_lane(Lane::Background);
        assert_eq!(ts.scheduler.classify(&input), Lane::Background);
        input.critical = true;
        assert_eq!(ts.scheduler.classify(&input), Lane::Critical);
        input.interactive = true;
        assert_eq!(ts.scheduler.classify(&input), Lane::Interactive);
        assert_eq!(
            ts.scheduler.classify(&DispatchInput::new(Id::from_string("u"))),
            Lane::Background
        );
    }

    #[tokio::test]
    async fn duplicate_dispatch_is_rejected() {
        let ts = create_test_scheduler(SchedulerSettings::default()).await;
        enqueue(&ts.scheduler, "a", Lane::Critical);
        let err = ts
            .scheduler
            .dispatch_task(&DispatchInput::new(Id::from_string("a")))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyScheduled(_)));
    }

    #[tokio::test]
    async fn batch_prefers_higher_lanes_and_respects_global_cap() {
        let ts = create_test_scheduler(settings(3, 3)).await;
        enqueue(&ts.scheduler, "bg-1", Lane::Background);
        enqueue(&ts.scheduler, "crit-1", Lane::Critical);
        enqueue(&ts.scheduler, "int-1", Lane::Interactive);
        enqueue(&ts.scheduler, "int-2", Lane::Interactive);

        let batch = ts.scheduler.get_next_batch(10);
        let ids: Vec<&str> = batch.iter().map(|t| t.task_id.as_ref()).collect();
        assert_eq!(ids, vec!["int-1", "int-2", "crit-1"]);
        assert_eq!(ts.scheduler.running_count(), 3);

        // Global cap is full until a slot is released.
        assert!(ts.scheduler.get_next_batch(10).is_empty());
        ts.scheduler.complete_task(&Id::from_string("int-1")).unwrap();
        let next = ts.scheduler.get_next_batch(10);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].task_id.as_ref(), "bg-1");
    }

    #[tokio::test]
    async fn lane_cap_lets_lower_lanes_through() {
        let ts = create_test_scheduler(settings(4, 1)).await;
        enqueue(&ts.scheduler, "int-1", Lane::Interactive);
        enqueue(&ts.scheduler, "int-2", Lane::Interactive);
        enqueue(&ts.scheduler, "bg-1", Lane::Background);

        let lanes: Vec<Lane> = ts.scheduler.get_next_batch(4).iter().map(|t| t.lane).collect();
        assert_eq!(lanes, vec![Lane::Interactive, Lane::Background]);
    }

    #[tokio::test]
    async fn starved_lane_gets_a_slot() {
        let settings = SchedulerSettings {
            global_cap: 1,
            lane_caps: [1; 3],
            starvation_window: 2,
            ..SchedulerSettings::default()
        };
        let ts = create_test_scheduler(settings).await;
        for n in 0..4 {
            enqueue(&ts.scheduler, &format!("int-{n}"), Lane::Interactive);
        }
        enqueue(&ts.scheduler, "bg", Lane::Background);

        let mut order = Vec::new();
        for _ in 0..4 {
            let batch = ts.scheduler.get_next_batch(1);
            let picked = batch[0].task_id.clone();
            order.push(picked.to_string());
            ts.scheduler.complete_task(&picked).unwrap();
        }
        assert_eq!(order, vec!["int-0", "int-1", "bg", "int-2"]);
    }

    #[tokio::test]
    async fn cancel_queued_and_running() {
        let ts = create_test_scheduler(settings(1, 1)).await;
        let running = enqueue(&ts.scheduler, "running", Lane::Critical);
        let queued = enqueue(&ts.scheduler, "queued", Lane::Critical);
        ts.scheduler.get_next_batch(1);

        assert_eq!(ts.scheduler.cancel_task(&queued), CancelOutcome::Dequeued);
        assert_eq!(ts.scheduler.cancel_task(&running), CancelOutcome::Released);
        assert_eq!(ts.scheduler.cancel_task(&running), CancelOutcome::NotScheduled);
        assert_eq!(ts.scheduler.running_count(), 0);
        assert_eq!(ts.scheduler.queued_count(), 0);
    }

    #[tokio::test]
    async fn cancel_blocks_task_so_it_is_not_requeued() {
        let ts = create_test_scheduler(settings(2, 2)).await;
        let task = ts.store.create_task(NewTask::new("queued", "feature")).await.unwrap();
        ts.scheduler
            .dispatch_task(&DispatchInput::new(task.id.clone()))
            .unwrap();

        let outcome = ts.scheduler.cancel(&task.id, "operator").await.unwrap();
        assert_eq!(outcome, CancelOutcome::Dequeued);
        assert!(!ts.scheduler.is_scheduled(&task.id));

        let blocked = ts.store.get_task(&task.id).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.metadata.escalation.unwrap().reason, CANCELLED_REASON);
        let candidates = ts.store.scheduling_candidates().await.unwrap();
        assert!(candidates.is_empty());

        // Cancelling again leaves the blocked task alone.
        let again = ts.scheduler.cancel(&task.id, "operator").await.unwrap();
        assert_eq!(again, CancelOutcome::NotScheduled);
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let ts = create_test_scheduler(SchedulerSettings::default()).await;
        let err = ts
            .scheduler
            .cancel(&Id::from_string("missing"), "operator")
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Store(StoreError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn complete_records_duration_metrics() {
        let ts = create_test_scheduler(SchedulerSettings::default()).await;
        let id = enqueue(&ts.scheduler, "t", Lane::Critical);
        ts.scheduler.get_next_batch(1);
        ts.scheduler.start_task(&id).unwrap();
        ts.clock.advance(Duration::seconds(3));

        let elapsed = ts.scheduler.complete_task(&id).unwrap();
        assert_eq!(elapsed, Duration::seconds(3));

        let snapshot = ts.scheduler.snapshot();
        let critical = &snapshot.lanes[Lane::Critical.index()];
        assert_eq!(critical.completed, 1);
        assert_eq!(critical.avg_duration_ms, Some(3000));
        assert!(ts.scheduler.complete_task(&id).is_err());
    }

    #[test]
    fn backoff_doubles_per_expiry() {
        let settings = SchedulerSettings {
            expiry_backoff_base_sec: 30,
            ..SchedulerSettings::default()
        };
        assert_eq!(settings.backoff_for(1), 30);
        assert_eq!(settings.backoff_for(2), 60);
        assert_eq!(settings.backoff_for(3), 120);
    }

    #[tokio::test]
    async fn repeated_lease_expiry_backs_off_then_blocks() {
        let settings = SchedulerSettings {
            max_lease_expiries: 2,
            expiry_backoff_base_sec: 10,
            ..SchedulerSettings::default()
        };
        let ts = create_test_scheduler(settings).await;
        let task = ts.store.create_task(NewTask::new("slow", "feature")).await.unwrap();
        ts.store
            .transition(&task.id, TaskStatus::InProgress, None, "start", Some("agent"))
            .await
            .unwrap();
        ts.scheduler
            .dispatch_task(&DispatchInput::new(task.id.clone()))
            .unwrap();

        for expected in 1..=2 {
            let batch = ts.scheduler.get_next_batch(1);
            assert_eq!(batch.len(), 1, "attempt {expected} should be eligible");
            let lease = Lease {
                task_id: task.id.clone(),
                holder: "agent".to_string(),
                acquired_at: ts.clock.now(),
                ttl: std::time::Duration::from_secs(1),
            };
            let outcome = ts.scheduler.handle_lease_expired(&lease).await.unwrap();
            assert_eq!(
                outcome,
                ExpiryOutcome::Requeued {
                    retry_after_sec: 10 * (1 << (expected - 1)),
                    expiries: expected,
                }
            );
            // Not eligible until the backoff passes.
            assert!(ts.scheduler.get_next_batch(1).is_empty());
            ts.clock.advance(Duration::seconds(60));
        }

        ts.scheduler.get_next_batch(1);
        let lease = Lease {
            task_id: task.id.clone(),
            holder: "agent".to_string(),
            acquired_at: ts.clock.now(),
            ttl: std::time::Duration::from_secs(1),
        };
        let outcome = ts.scheduler.handle_lease_expired(&lease).await.unwrap();
        assert_eq!(outcome, ExpiryOutcome::Escalated { expiries: 3 });

        let blocked = ts.store.get_task(&task.id).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        let escalation = blocked.metadata.escalation.unwrap();
        assert_eq!(escalation.reason, "lease_expired");
        assert_eq!(escalation.count, 3);
        assert!(!ts.scheduler.is_scheduled(&task.id));

        let events = ts.store.list_events(Some(&task.id)).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "TASK_ESCALATED"));
        assert_eq!(
            events.iter().filter(|e| e.event_type == "LEASE_EXPIRED").count(),
            3
        );
    }
}
