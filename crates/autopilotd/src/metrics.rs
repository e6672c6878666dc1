//! Audit write metrics.
//!
//! Audit writes that fail are logged and skipped so task progress never
//! blocks on them. These counters make the skips visible for reconciliation.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct AuditMetrics {
    pub skipped_events: AtomicUsize,
    pub skipped_decisions: AtomicUsize,
    pub skipped_checkpoints: AtomicUsize,
    pub skipped_quality_metrics: AtomicUsize,
    pub skipped_critic_records: AtomicUsize,
    pub skipped_context: AtomicUsize,
}

/// Point-in-time copy of the counters, for the HTTP API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditSnapshot {
    pub skipped_events: usize,
    pub skipped_decisions: usize,
    pub skipped_checkpoints: usize,
    pub skipped_quality_metrics: usize,
    pub skipped_critic_records: usize,
    pub skipped_context: usize,
}

impl AuditMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_skipped_event(&self) {
        self.skipped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_decision(&self) {
        self.skipped_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_checkpoint(&self) {
        self.skipped_checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_quality_metric(&self) {
        self.skipped_quality_metrics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_critic_record(&self) {
        self.skipped_critic_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped_context(&self) {
        self.skipped_context.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AuditSnapshot {
        AuditSnapshot {
            skipped_events: self.skipped_events.load(Ordering::Relaxed),
            skipped_decisions: self.skipped_decisions.load(Ordering::Relaxed),
            skipped_checkpoints: self.skipped_checkpoints.load(Ordering::Relaxed),
            skipped_quality_metrics: self.skipped_quality_metrics.load(Ordering::Relaxed),
            skipped_critic_records: self.skipped_critic_records.load(Ordering::Relaxed),
            skipped_context: self.skipped_context.load(Ordering::Relaxed),
        }
    }

    pub fn total_skipped(&self) -> usize {
        let s = self.snapshot();
        s.skipped_events
            + s.skipped_decisions
            + s.skipped_checkpoints
            + s.skipped_quality_metrics
            + s.skipped_critic_records
            + s.skipped_context
    }
}
