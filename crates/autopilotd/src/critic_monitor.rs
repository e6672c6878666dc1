//! Critic performance monitor.
//!
//! Reads each critic's recent runtime history and keeps remediation tasks in
//! step with it:
//! - opens or refreshes one remediation task per underperforming critic
//! - resolves it after enough consecutive passes
//! - raises one global remediation task when many critics degrade at once
//!
//! It also decides when a low-authority critic can be skipped because it is
//! currently healthy.

use std::sync::Arc;

use autopilot_core::{
    remediation_key, Config, CriticAuthority, CriticHistoryRecord, CriticResult, Id, Lane, NewTask,
    RemediationMetadata, RemediationScope, Severity, Task, TaskMetadata,
};
use chrono::Duration;
use serde::Serialize;
use serde_json::Map;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::notify::{StoreNotification, Subscription};
use crate::store::{StoreError, TaskStore};

const MONITOR_AGENT: &str = "performance_monitor";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode remediation metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub history_limit: usize,
    pub origin: String,
    pub director_consecutive_failures: usize,
    pub director_zero_pass_observations: usize,
    pub autopilot_consecutive_failures: usize,
    pub autopilot_ratio_observations: usize,
    pub autopilot_failure_ratio: f64,
    pub resolve_consecutive_passes: usize,
    pub systemic_min_critics: usize,
    pub systemic_ratio: f64,
    pub director_role: String,
    pub autopilot_role: String,
    pub skip_window_default: Duration,
    pub skip_window_advisory: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        let seconds = |secs: u64| {
            Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
        };
        Self {
            history_limit: config.critic_history_limit,
            origin: config.critic_history_origin.clone(),
            director_consecutive_failures: config.director_consecutive_failures,
            director_zero_pass_observations: config.director_zero_pass_observations,
            autopilot_consecutive_failures: config.autopilot_consecutive_failures,
            autopilot_ratio_observations: config.autopilot_ratio_observations,
            autopilot_failure_ratio: config.autopilot_failure_ratio,
            resolve_consecutive_passes: config.resolve_consecutive_passes,
            systemic_min_critics: config.systemic_min_critics,
            systemic_ratio: config.systemic_ratio,
            director_role: config.director_role.clone(),
            autopilot_role: config.autopilot_role.clone(),
            skip_window_default: seconds(config.skip_window_default_sec),
            skip_window_advisory: seconds(config.skip_window_advisory_sec),
        }
    }

    fn role_for(&self, severity: Severity) -> &str {
        match severity {
            Severity::Director => &self.director_role,
            Severity::Autopilot => &self.autopilot_role,
        }
    }

    /// `max(systemic_min_critics, ceil(systemic_ratio * evaluated))`.
    pub fn systemic_threshold(&self, evaluated: usize) -> usize {
        let scaled = (self.systemic_ratio * evaluated as f64).ceil() as usize;
        self.systemic_min_critics.max(scaled)
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Counts over a newest-first history window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CriticStats {
    pub observations: usize,
    pub failures: usize,
    pub consecutive_failures: usize,
    pub consecutive_passes: usize,
}

impl CriticStats {
    pub fn from_history(history: &[CriticHistoryRecord]) -> Self {
        let failures = history.iter().filter(|r| !r.passed).count();
        let consecutive_failures = history.iter().take_while(|r| !r.passed).count();
        let consecutive_passes = history.iter().take_while(|r| r.passed).count();
        Self {
            observations: history.len(),
            failures,
            consecutive_failures,
            consecutive_passes,
        }
    }

    pub fn passes(&self) -> usize {
        self.observations - self.failures
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            self.failures as f64 / self.observations as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticReport {
    pub critic: String,
    pub stats: CriticStats,
    pub severity: Option<Severity>,
    pub reason: Option<String>,
    /// Most recent failure output, if any.
    pub latest_failure: Option<String>,
}

/// Rate a critic from its newest-first history.
pub fn assess(
    critic: &str,
    history: &[CriticHistoryRecord],
    settings: &MonitorSettings,
) -> CriticReport {
    let stats = CriticStats::from_history(history);
    let failing_streak = stats.consecutive_failures >= settings.director_consecutive_failures;
    let never_passed =
        stats.observations >= settings.director_zero_pass_observations && stats.passes() == 0;
    let (severity, reason) = if failing_streak {
        (
            Some(Severity::Director),
            Some(format!("{} consecutive failures", stats.consecutive_failures)),
        )
    } else if never_passed {
        (
            Some(Severity::Director),
            Some(format!("no passes in {} observations", stats.observations)),
        )
    } else if stats.consecutive_failures >= settings.autopilot_consecutive_failures {
        (
            Some(Severity::Autopilot),
            Some(format!("{} consecutive failures", stats.consecutive_failures)),
        )
    } else if stats.observations >= settings.autopilot_ratio_observations
        && stats.failure_ratio() >= settings.autopilot_failure_ratio
    {
        (
            Some(Severity::Autopilot),
            Some(format!(
                "failure ratio {:.2} over {} observations",
                stats.failure_ratio(),
                stats.observations
            )),
        )
    } else {
        (None, None)
    };

    let latest_failure = history
        .iter()
        .find(|r| !r.passed)
        .and_then(|r| r.metadata.get("failure"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    CriticReport {
        critic: critic.to_string(),
        stats,
        severity,
        reason,
        latest_failure,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "task_id", rename_all = "snake_case")]
pub enum RemediationAction {
    None,
    Opened(Id),
    Updated(Id),
    Unchanged(Id),
    Resolved(Id),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemicReport {
    pub evaluated: usize,
    pub flagged: Vec<String>,
    pub threshold: usize,
    pub action: RemediationAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticEvaluation {
    pub report: CriticReport,
    pub action: RemediationAction,
    pub systemic: SystemicReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: String,
}

pub struct CriticMonitor {
    store: Arc<TaskStore>,
    clock: Arc<dyn Clock>,
    settings: MonitorSettings,
    /// Serializes evaluations so remediation upserts never interleave.
    evaluation: Mutex<()>,
}

impl CriticMonitor {
    pub fn new(store: Arc<TaskStore>, clock: Arc<dyn Clock>, settings: MonitorSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            evaluation: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Record a critic result under the monitored origin and evaluate it.
    pub async fn observe(&self, result: &CriticResult) -> Result<CriticEvaluation> {
        self.store
            .record_critic_result(result, &self.settings.origin)
            .await;
        self.evaluate_critic(&result.critic_name).await
    }

    async fn history(&self, critic: &str) -> Result<Vec<CriticHistoryRecord>> {
        Ok(self
            .store
            .get_critic_history(critic, Some(&self.settings.origin), self.settings.history_limit)
            .await?)
    }

    pub async fn report(&self, critic: &str) -> Result<CriticReport> {
        let history = self.history(critic).await?;
        Ok(assess(critic, &history, &self.settings))
    }

    /// Apply escalation and resolution rules for one critic, then the
    /// systemic rule.
    pub async fn evaluate_critic(&self, critic: &str) -> Result<CriticEvaluation> {
        let _guard = self.evaluation.lock().await;
        let report = self.report(critic).await?;
        let key = remediation_key(&RemediationScope::Critic {
            critic: critic.to_string(),
        });
        let open = self.store.find_open_remediation(&key).await?;

        let recovered = report.stats.consecutive_passes >= self.settings.resolve_consecutive_passes;
        let action = if recovered {
            match open {
                Some(task) => {
                    let summary = format!(
                        "critic {critic} recovered: {} consecutive passes",
                        report.stats.consecutive_passes
                    );
                    self.resolve(&task, &summary).await?
                }
                None => RemediationAction::None,
            }
        } else if let Some(severity) = report.severity {
            let remediation = RemediationMetadata {
                consecutive_failures: report.stats.consecutive_failures as u32,
                total_observations: report.stats.observations as u32,
                ..RemediationMetadata::for_critic(critic, severity)
            };
            let description = self.critic_description(&report, severity);
            self.upsert(open, remediation, &format!("Remediate critic {critic}"), &description)
                .await?
        } else {
            open.map_or(RemediationAction::None, |task| RemediationAction::Unchanged(task.id))
        };

        let systemic = self.evaluate_systemic_locked().await?;
        Ok(CriticEvaluation {
            report,
            action,
            systemic,
        })
    }

    /// Re-run the systemic rule over every critic with runtime history.
    pub async fn evaluate_systemic(&self) -> Result<SystemicReport> {
        let _guard = self.evaluation.lock().await;
        self.evaluate_systemic_locked().await
    }

    async fn evaluate_systemic_locked(&self) -> Result<SystemicReport> {
        let critics = self.store.critic_names(&self.settings.origin).await?;
        let mut flagged = Vec::new();
        let mut severity = Severity::Autopilot;
        for critic in &critics {
            let report = self.report(critic).await?;
            if let Some(s) = report.severity {
                severity = severity.max(s);
                flagged.push(critic.clone());
            }
        }
        let evaluated = critics.len();
        let threshold = self.settings.systemic_threshold(evaluated);
        let open = self
            .store
            .find_open_remediation(&remediation_key(&RemediationScope::Global))
            .await?;

        let action = if evaluated > 0 && flagged.len() >= threshold {
            let remediation = RemediationMetadata {
                total_observations: evaluated as u32,
                consecutive_failures: flagged.len() as u32,
                ..RemediationMetadata::global(severity)
            };
            let description = format!(
                "{} of {evaluated} critics are underperforming (threshold {threshold}): {}.\n\
                 Owner role: {}",
                flagged.len(),
                flagged.join(", "),
                self.settings.role_for(severity)
            );
            self.upsert(open, remediation, "Systemic critic degradation", &description)
                .await?
        } else {
            match open {
                Some(task) if self.store.count_open_critic_remediations().await? == 0 => {
                    self.resolve(&task, "no critic-level remediation tasks remain open")
                        .await?
                }
                Some(task) => RemediationAction::Unchanged(task.id),
                None => RemediationAction::None,
            }
        };

        Ok(SystemicReport {
            evaluated,
            flagged,
            threshold,
            action,
        })
    }

    /// Create the remediation task for a scope, or refresh the open one.
    /// Severity never drops while the task is open.
    async fn upsert(
        &self,
        open: Option<Task>,
        mut remediation: RemediationMetadata,
        title: &str,
        description: &str,
    ) -> Result<RemediationAction> {
        let Some(task) = open else {
            let severity = remediation.severity;
            let metadata = TaskMetadata {
                lane: Some(match severity {
                    Severity::Director => Lane::Critical,
                    Severity::Autopilot => Lane::Background,
                }),
                ..TaskMetadata::remediation(remediation)
            };
            let new = NewTask {
                assigned_to: Some(self.settings.role_for(severity).to_string()),
                ..NewTask::new(format!("{title} ({})", severity.as_str()), "remediation")
                    .with_description(description)
                    .with_metadata(metadata)
            };
            return match self.store.create_task(new).await {
                Ok(task) => {
                    warn!(
                        task_id = %task.id,
                        severity = severity.as_str(),
                        "remediation task opened"
                    );
                    Ok(RemediationAction::Opened(task.id))
                }
                Err(StoreError::DuplicateRemediation(key)) => {
                    debug!(key = %key, "remediation already open");
                    let existing = self.store.find_open_remediation(&key).await?;
                    Ok(existing.map_or(RemediationAction::None, |t| {
                        RemediationAction::Unchanged(t.id)
                    }))
                }
                Err(e) => Err(e.into()),
            };
        };

        if let Some(current) = &task.metadata.remediation {
            remediation.severity = remediation.severity.max(current.severity);
            if *current == remediation {
                return Ok(RemediationAction::Unchanged(task.id));
            }
        }

        let mut patch = Map::new();
        patch.insert("remediation".to_string(), serde_json::to_value(&remediation)?);
        let correlation_id = format!("remediation-update:{}:{}", task.id, Id::new());
        self.store
            .amend(&task.id, &patch, Some(description), &correlation_id)
            .await?;
        info!(
            task_id = %task.id,
            severity = remediation.severity.as_str(),
            "remediation task updated"
        );
        Ok(RemediationAction::Updated(task.id))
    }

    async fn resolve(&self, task: &Task, summary: &str) -> Result<RemediationAction> {
        let prefix = format!("remediation-resolve:{}", task.id);
        self.store
            .drive_to_done(&task.id, MONITOR_AGENT, summary, &prefix)
            .await?;
        info!(task_id = %task.id, summary, "remediation task resolved");
        Ok(RemediationAction::Resolved(task.id.clone()))
    }

    fn critic_description(&self, report: &CriticReport, severity: Severity) -> String {
        let mut description = format!(
            "Critic `{}` is underperforming ({}): {}.\n\
             Observations: {} (failures {}, consecutive failures {}).\n",
            report.critic,
            severity.as_str(),
            report.reason.as_deref().unwrap_or("threshold reached"),
            report.stats.observations,
            report.stats.failures,
            report.stats.consecutive_failures,
        );
        if let Some(failure) = &report.latest_failure {
            description.push_str(&format!("Latest failure: {failure}\n"));
        }
        description.push_str(&format!("Owner role: {}", self.settings.role_for(severity)));
        description
    }

    /// Whether a critic can be skipped this round. Critical and blocking
    /// critics always run.
    pub async fn should_skip(
        &self,
        critic: &str,
        authority: CriticAuthority,
    ) -> Result<SkipDecision> {
        if !authority.may_skip() {
            return Ok(SkipDecision {
                skip: false,
                reason: format!("{} critics always run", authority.as_str()),
            });
        }
        let history = self.history(critic).await?;
        let Some(last) = history.first() else {
            return Ok(SkipDecision {
                skip: false,
                reason: "no recorded runs".to_string(),
            });
        };
        if history.iter().any(|r| !r.passed) {
            return Ok(SkipDecision {
                skip: false,
                reason: "recent failure in history".to_string(),
            });
        }
        let window = match authority {
            CriticAuthority::Advisory => self.settings.skip_window_advisory,
            _ => self.settings.skip_window_default,
        };
        let age = self.clock.now() - last.timestamp;
        if age < window {
            Ok(SkipDecision {
                skip: true,
                reason: format!(
                    "healthy, last run {}s ago (window {}s)",
                    age.num_seconds(),
                    window.num_seconds()
                ),
            })
        } else {
            Ok(SkipDecision {
                skip: false,
                reason: "last run is outside the skip window".to_string(),
            })
        }
    }

    /// Evaluate critics as their results are recorded, until `cancel` fires.
    /// The subscription is removed on exit.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription, cancel: CancellationToken) {
        info!("critic monitor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                notification = subscription.receiver.recv() => {
                    let Some(notification) = notification else {
                        break;
                    };
                    let StoreNotification::CriticResultRecorded { critic, origin, .. } =
                        notification
                    else {
                        continue;
                    };
                    if origin != self.settings.origin {
                        continue;
                    }
                    if let Err(e) = self.evaluate_critic(&critic).await {
                        warn!(critic = %critic, error = %e, "critic evaluation failed");
                    }
                }
            }
        }
        self.store.bus().unsubscribe(subscription.id);
        info!("critic monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::AuditMetrics;
    use crate::notify::EventBus;
    use crate::storage::Storage;
    use autopilot_core::TaskStatus;
    use tempfile::TempDir;

    struct TestMonitor {
        monitor: Arc<CriticMonitor>,
        store: Arc<TaskStore>,
        clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    async fn create_test_monitor() -> TestMonitor {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let store = Arc::new(TaskStore::new(
            Arc::new(storage),
            Arc::new(EventBus::new()),
            Arc::new(AuditMetrics::new()),
        ));
        let clock = Arc::new(ManualClock::default());
        let monitor = Arc::new(CriticMonitor::new(
            Arc::clone(&store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            MonitorSettings::default(),
        ));
        TestMonitor {
            monitor,
            store,
            clock,
            _dir: dir,
        }
    }

    /// Feed results in order, one second apart.
    async fn feed(tm: &TestMonitor, critic: &str, results: &[bool]) -> CriticEvaluation {
        let mut last = None;
        for passed in results {
            tm.clock.advance(Duration::seconds(1));
            let mut result = CriticResult::new(critic, *passed).at(tm.clock.now());
            if !passed {
                result.stderr = Some(format!("{critic}: assertion failed"));
            }
            last = Some(tm.monitor.observe(&result).await.unwrap());
        }
        last.unwrap()
    }

    fn record(passed: bool) -> CriticHistoryRecord {
        CriticHistoryRecord {
            critic_name: "c".to_string(),
            passed,
            timestamp: chrono::Utc::now(),
            origin: "runtime".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn history(newest_first: &[bool]) -> Vec<CriticHistoryRecord> {
        newest_first.iter().map(|p| record(*p)).collect()
    }

    #[test]
    fn severity_thresholds() {
        let settings = MonitorSettings::default();
        let rate = |h: &[bool]| assess("c", &history(h), &settings).severity;

        assert_eq!(rate(&[false, false]), None);
        assert_eq!(rate(&[false, false, false]), Some(Severity::Autopilot));
        assert_eq!(rate(&[false; 5]), Some(Severity::Director));
        // 4 of 5 failed: ratio rule.
        assert_eq!(rate(&[false, true, false, false, false]), Some(Severity::Autopilot));
        assert_eq!(rate(&[true, false, false, false, true]), None);
        assert_eq!(rate(&[true, true, true]), None);
    }

    #[test]
    fn systemic_threshold_uses_ratio_with_floor() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.systemic_threshold(5), 3);
        assert_eq!(settings.systemic_threshold(2), 2);
        assert_eq!(settings.systemic_threshold(1), 2);
        assert_eq!(settings.systemic_threshold(10), 6);
    }

    #[tokio::test]
    async fn failures_open_one_remediation_and_passes_resolve_it() {
        let tm = create_test_monitor().await;

        let eval = feed(&tm, "build", &[false, false, false]).await;
        let RemediationAction::Opened(task_id) = eval.action.clone() else {
            panic!("expected remediation to open, got {:?}", eval.action);
        };
        let task = tm.store.get_task(&task_id).await.unwrap();
        assert_eq!(task.assigned_to.as_deref(), Some("autopilot"));
        assert!(task.description.contains("build: assertion failed"));

        let eval = feed(&tm, "build", &[false, false]).await;
        assert_eq!(eval.report.severity, Some(Severity::Director));
        assert_eq!(eval.action, RemediationAction::Updated(task_id.clone()));

        let remediation = tm.store.list_tasks(None).await.unwrap();
        assert_eq!(remediation.len(), 1);
        let meta = remediation[0].metadata.remediation.clone().unwrap();
        assert_eq!(meta.consecutive_failures, 5);
        assert_eq!(meta.severity, Severity::Director);

        feed(&tm, "build", &[true]).await;
        assert_eq!(
            tm.store.get_task(&task_id).await.unwrap().status,
            TaskStatus::Pending
        );
        let eval = feed(&tm, "build", &[true]).await;
        assert_eq!(eval.action, RemediationAction::Resolved(task_id.clone()));
        let done = tm.store.get_task(&task_id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.metadata.resolution.unwrap().contains("recovered"));
    }

    #[tokio::test]
    async fn repeated_evaluation_is_idempotent() {
        let tm = create_test_monitor().await;
        let eval = feed(&tm, "lint", &[false, false, false]).await;
        let RemediationAction::Opened(task_id) = eval.action else {
            panic!("expected remediation");
        };
        let again = tm.monitor.evaluate_critic("lint").await.unwrap();
        assert_eq!(again.action, RemediationAction::Unchanged(task_id));
        assert_eq!(tm.store.list_tasks(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn systemic_remediation_needs_threshold_of_flagged_critics() {
        let tm = create_test_monitor().await;
        for critic in ["a", "b", "c", "d", "e"] {
            feed(&tm, critic, &[true]).await;
        }
        feed(&tm, "a", &[false, false, false]).await;
        let eval = feed(&tm, "b", &[false, false, false]).await;
        assert_eq!(eval.systemic.flagged.len(), 2);
        assert_eq!(eval.systemic.threshold, 3);
        assert_eq!(eval.systemic.action, RemediationAction::None);

        let eval = feed(&tm, "c", &[false, false, false]).await;
        let RemediationAction::Opened(global_id) = eval.systemic.action else {
            panic!("expected systemic remediation, got {:?}", eval.systemic.action);
        };
        let global = tm.store.get_task(&global_id).await.unwrap();
        assert_eq!(
            global.metadata.remediation.unwrap().scope,
            RemediationScope::Global
        );

        for critic in ["a", "b", "c"] {
            feed(&tm, critic, &[true, true]).await;
        }
        assert_eq!(tm.store.count_open_critic_remediations().await.unwrap(), 0);
        assert_eq!(
            tm.store.get_task(&global_id).await.unwrap().status,
            TaskStatus::Done
        );
    }

    #[tokio::test]
    async fn healthy_low_authority_critics_are_skipped_within_window() {
        let tm = create_test_monitor().await;
        feed(&tm, "docs", &[true, true]).await;

        let decision = tm
            .monitor
            .should_skip("docs", CriticAuthority::Default)
            .await
            .unwrap();
        assert!(decision.skip);
        assert!(!tm
            .monitor
            .should_skip("docs", CriticAuthority::Critical)
            .await
            .unwrap()
            .skip);

        tm.clock.advance(Duration::seconds(1000));
        assert!(!tm.monitor.should_skip("docs", CriticAuthority::Default).await.unwrap().skip);
        assert!(tm.monitor.should_skip("docs", CriticAuthority::Advisory).await.unwrap().skip);

        feed(&tm, "docs", &[false]).await;
        assert!(!tm.monitor.should_skip("docs", CriticAuthority::Advisory).await.unwrap().skip);
        assert!(!tm.monitor.should_skip("unknown", CriticAuthority::Advisory).await.unwrap().skip);
    }

    #[tokio::test]
    async fn synthetic_origin_does_not_escalate() {
        let tm = create_test_monitor().await;
        for _ in 0..6 {
            tm.store
                .record_critic_result(&CriticResult::new("perf", false), "synthetic")
                .await;
        }
        let eval = tm.monitor.evaluate_critic("perf").await.unwrap();
        assert_eq!(eval.report.stats.observations, 0);
        assert_eq!(eval.action, RemediationAction::None);
    }

    #[tokio::test]
    async fn listener_evaluates_recorded_results_and_unsubscribes() {
        let tm = create_test_monitor().await;
        let cancel = CancellationToken::new();
        let subscription = tm.store.bus().subscribe();
        let handle = tokio::spawn(Arc::clone(&tm.monitor).run(subscription, cancel.clone()));

        for _ in 0..3 {
            tm.store
                .record_critic_result(&CriticResult::new("security", false), "runtime")
                .await;
        }
        let mut opened = None;
        for _ in 0..50 {
            opened = tm.store.find_open_remediation("critic:security").await.unwrap();
            if opened.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(opened.is_some());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(tm.store.bus().subscriber_count(), 0);
    }
}
