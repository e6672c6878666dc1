//! End-to-end lifecycle tests across the dispatcher, quality gate and critic
//! monitor, with a scripted agent standing in for `agent_cmd`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autopilot_core::{
    remediation_key, CheckOutcome, CriticResult, NewTask, PeerReview, RemediationScope, Severity,
    Task, TaskStatus, VerificationEvidence,
};
use autopilotd::clock::{Clock, ManualClock};
use autopilotd::critic_monitor::{CriticMonitor, MonitorSettings, RemediationAction};
use autopilotd::dispatcher::{CompletionOutcome, Dispatcher};
use autopilotd::executor::{AgentExecutor, ExecutionReport, ExecutorError};
use autopilotd::lease::LeaseManager;
use autopilotd::metrics::AuditMetrics;
use autopilotd::notify::EventBus;
use autopilotd::quality_gate::{GateSettings, QualityGate};
use autopilotd::scheduler::{Scheduler, SchedulerSettings};
use autopilotd::storage::Storage;
use autopilotd::store::TaskStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Replays queued reports in order; repeats the last one when drained.
struct ScriptedAgent {
    reports: Mutex<VecDeque<ExecutionReport>>,
}

impl ScriptedAgent {
    fn new(reports: Vec<ExecutionReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
        }
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(
        &self,
        _task: &Task,
        _cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        let mut reports = self.reports.lock().unwrap();
        let report = if reports.len() > 1 {
            reports.pop_front()
        } else {
            reports.front().cloned()
        };
        report.ok_or(ExecutorError::MissingReport)
    }
}

fn evidence(tests_pass: bool, critics: Vec<CriticResult>) -> ExecutionReport {
    ExecutionReport::completed(VerificationEvidence {
        summary: "implemented".to_string(),
        build: Some(CheckOutcome {
            passed: true,
            output: "ok".to_string(),
        }),
        tests: Some(CheckOutcome {
            passed: tests_pass,
            output: if tests_pass { "4 passed" } else { "1 failed" }.to_string(),
        }),
        changed_files: vec!["src/lib.rs".to_string(), "tests/lib.rs".to_string()],
        critic_results: critics,
        peer_review: Some(PeerReview {
            approved: true,
            reviewer: "peer".to_string(),
            notes: String::new(),
        }),
    })
}

struct TestPlane {
    store: Arc<TaskStore>,
    gate: Arc<QualityGate>,
    monitor: Arc<CriticMonitor>,
    dispatcher: Arc<Dispatcher>,
    leases: Arc<LeaseManager>,
    _dir: TempDir,
}

async fn create_plane(agent: ScriptedAgent) -> TestPlane {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(&dir.path().join("plane.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let store = Arc::new(TaskStore::new(
        Arc::new(storage),
        Arc::new(EventBus::new()),
        Arc::new(AuditMetrics::new()),
    ));
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        SchedulerSettings::default(),
    ));
    let leases = Arc::new(LeaseManager::new(Arc::clone(&clock), Duration::from_secs(900)));
    let gate = Arc::new(QualityGate::new(Arc::clone(&store), GateSettings::default()));
    let monitor = Arc::new(CriticMonitor::new(
        Arc::clone(&store),
        clock,
        MonitorSettings::default(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        scheduler,
        Arc::clone(&leases),
        Arc::clone(&gate),
        Arc::new(agent),
    ));
    TestPlane {
        store,
        gate,
        monitor,
        dispatcher,
        leases,
        _dir: dir,
    }
}

impl TestPlane {
    /// One tick followed by settling the single resulting completion.
    async fn run_once(&self) -> CompletionOutcome {
        let tick = self.dispatcher.tick().await.unwrap();
        assert_eq!(tick.dispatched.len(), 1, "expected exactly one dispatch");
        self.dispatcher.next_completion().await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn dispatched_task_is_approved_and_done() {
    let plane = create_plane(ScriptedAgent::new(vec![evidence(true, Vec::new())])).await;
    let task = plane.store.create_task(NewTask::new("T1", "feature")).await.unwrap();

    assert_eq!(plane.run_once().await, CompletionOutcome::Approved);

    let task = plane.store.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.metadata.resolution.as_deref(), Some("implemented"));
    assert_eq!(plane.store.list_decisions(&task.id).await.unwrap().len(), 1);
    assert!(plane.leases.active_leases().is_empty());
    assert_eq!(plane.dispatcher.running_count(), 0);
}

#[tokio::test]
async fn rejection_retries_then_succeeds() {
    let plane = create_plane(ScriptedAgent::new(vec![
        evidence(false, Vec::new()),
        evidence(true, Vec::new()),
    ]))
    .await;
    let task = plane.store.create_task(NewTask::new("flaky", "bug")).await.unwrap();

    assert_eq!(plane.run_once().await, CompletionOutcome::Rejected);
    let rejected = plane.store.get_task(&task.id).await.unwrap();
    assert_eq!(rejected.status, TaskStatus::NeedsImprovement);
    assert!(rejected.metadata.last_rejection.is_some());

    assert_eq!(plane.run_once().await, CompletionOutcome::Approved);
    let decisions = plane.store.list_decisions(&task.id).await.unwrap();
    let attempts: Vec<u32> = decisions.iter().map(|d| d.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(!decisions[0].consensus);
    assert!(decisions[1].consensus);
}

#[tokio::test]
async fn resolution_ceiling_raises_incident_and_stops_dispatch() {
    let plane = create_plane(ScriptedAgent::new(vec![evidence(false, Vec::new())])).await;
    let task = plane.store.create_task(NewTask::new("stuck", "feature")).await.unwrap();

    assert_eq!(plane.run_once().await, CompletionOutcome::Rejected);
    assert_eq!(plane.run_once().await, CompletionOutcome::Rejected);
    assert_eq!(plane.run_once().await, CompletionOutcome::Incident);

    let blocked = plane.store.get_task(&task.id).await.unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert_eq!(
        blocked.metadata.escalation.as_ref().map(|e| e.reason.as_str()),
        Some("resolution_ceiling")
    );

    let tick = plane.dispatcher.tick().await.unwrap();
    assert!(tick.dispatched.is_empty());

    let evidence = evidence(true, Vec::new()).evidence;
    assert!(plane.gate.verify(&task.id, &evidence).await.is_err());
}

#[tokio::test]
async fn critic_failures_in_evidence_reach_the_monitor() {
    let failing_lint = CriticResult::crashed("lint", "clippy exploded");
    let plane = create_plane(ScriptedAgent::new(vec![evidence(true, vec![failing_lint])])).await;

    let cancel = CancellationToken::new();
    let listener = tokio::spawn(
        Arc::clone(&plane.monitor).run(plane.store.bus().subscribe(), cancel.clone()),
    );

    let task = plane.store.create_task(NewTask::new("T", "feature")).await.unwrap();
    // Failing critics block approval, so each run is a rejection.
    for _ in 0..3 {
        plane.run_once().await;
    }
    assert_eq!(
        plane.store.get_task(&task.id).await.unwrap().status,
        TaskStatus::Blocked
    );

    let key = remediation_key(&RemediationScope::Critic {
        critic: "lint".to_string(),
    });
    let mut remediation = None;
    for _ in 0..100 {
        remediation = plane.store.find_open_remediation(&key).await.unwrap();
        if remediation.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let remediation = remediation.expect("remediation task was not opened");
    assert_eq!(remediation.task_type, "remediation");

    cancel.cancel();
    listener.await.unwrap();
    assert_eq!(plane.store.bus().subscriber_count(), 0);
}

#[tokio::test]
async fn five_failures_then_two_passes_resolves_single_remediation() {
    let plane = create_plane(ScriptedAgent::new(vec![evidence(true, Vec::new())])).await;

    let mut opened = None;
    for _ in 0..5 {
        let evaluation = plane
            .monitor
            .observe(&CriticResult::new("typecheck", false))
            .await
            .unwrap();
        if let RemediationAction::Opened(id) = evaluation.action {
            assert!(opened.is_none(), "remediation opened twice");
            opened = Some(id);
        }
    }
    let opened = opened.unwrap();

    let remediations: Vec<Task> = plane
        .store
        .list_tasks(None)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.task_type == "remediation")
        .collect();
    assert_eq!(remediations.len(), 1);
    // Five consecutive failures crosses the director threshold.
    let severity = remediations[0]
        .metadata
        .remediation
        .as_ref()
        .map(|r| r.severity);
    assert_eq!(severity, Some(Severity::Director));

    for _ in 0..2 {
        plane
            .monitor
            .observe(&CriticResult::new("typecheck", true))
            .await
            .unwrap();
    }
    let resolved = plane.store.get_task(&opened).await.unwrap();
    assert_eq!(resolved.status, TaskStatus::Done);
    assert!(resolved.metadata.resolution.is_some());
}
