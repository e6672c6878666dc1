//! Typed task metadata.
//!
//! Known keys (remediation tags, revision links, escalation notes, scheduling
//! hints) are typed fields; everything else lands in the open `extra` map.
//! Patches are JSON objects merged key-wise, with `null` removing a key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Id, Lane, Severity};

/// Producer of auto-generated remediation tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationSource {
    #[default]
    PerformanceMonitor,
}

/// What a remediation task is about: one critic or the whole critic fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RemediationScope {
    Critic { critic: String },
    Global,
}

/// Metadata carried by remediation tasks opened by the critic monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationMetadata {
    pub source: RemediationSource,
    #[serde(flatten)]
    pub scope: RemediationScope,
    pub severity: Severity,
    pub consecutive_failures: u32,
    pub total_observations: u32,
}

impl RemediationMetadata {
    pub fn for_critic(critic: impl Into<String>, severity: Severity) -> Self {
        Self {
            source: RemediationSource::PerformanceMonitor,
            scope: RemediationScope::Critic {
                critic: critic.into(),
            },
            severity,
            consecutive_failures: 0,
            total_observations: 0,
        }
    }

    pub fn global(severity: Severity) -> Self {
        Self {
            source: RemediationSource::PerformanceMonitor,
            scope: RemediationScope::Global,
            severity,
            consecutive_failures: 0,
            total_observations: 0,
        }
    }

    /// Upsert key: `critic:<name>` or `global`.
    pub fn key(&self) -> String {
        remediation_key(&self.scope)
    }

    pub fn critic(&self) -> Option<&str> {
        match &self.scope {
            RemediationScope::Critic { critic } => Some(critic),
            RemediationScope::Global => None,
        }
    }
}

pub fn remediation_key(scope: &RemediationScope) -> String {
    match scope {
        RemediationScope::Critic { critic } => format!("critic:{critic}"),
        RemediationScope::Global => "global".to_string(),
    }
}

/// Note attached when a task is escalated out of the automatic loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    /// Machine-readable cause (`lease_expired`, `resolution_ceiling`).
    pub reason: String,
    pub note: String,
    pub count: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<RemediationMetadata>,
    /// Set on revisions: the completed task this one reopens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_of: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rejection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskMetadata {
    pub fn remediation(remediation: RemediationMetadata) -> Self {
        Self {
            remediation: Some(remediation),
            ..Self::default()
        }
    }

    /// Merge a JSON object patch. The result must still be valid typed metadata;
    /// on error `self` is left untouched.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), serde_json::Error> {
        let mut merged = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        *self = serde_json::from_value(Value::Object(merged))?;
        Ok(())
    }

    pub fn remediation_key(&self) -> Option<String> {
        self.remediation.as_ref().map(RemediationMetadata::key)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remediation_metadata_matches_wire_schema() {
        let mut meta = RemediationMetadata::for_critic("build", Severity::Autopilot);
        meta.consecutive_failures = 3;
        meta.total_observations = 4;

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            value,
            json!({
                "source": "performance_monitor",
                "scope": "critic",
                "critic": "build",
                "severity": "autopilot",
                "consecutive_failures": 3,
                "total_observations": 4,
            })
        );

        let back: RemediationMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn global_scope_has_no_critic_field() {
        let meta = RemediationMetadata::global(Severity::Director);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["scope"], "global");
        assert!(value.get("critic").is_none());
        assert_eq!(meta.key(), "global");
    }

    #[test]
    fn unknown_keys_are_kept_in_extra() {
        let meta: TaskMetadata =
            serde_json::from_value(json!({"owner": "ml-team", "lane": "critical"})).unwrap();
        assert_eq!(meta.lane, Some(Lane::Critical));
        assert_eq!(meta.extra.get("owner"), Some(&json!("ml-team")));
    }

    #[test]
    fn patch_merges_and_removes_keys() {
        let mut meta = TaskMetadata::default();
        meta.extra.insert("owner".into(), json!("ml-team"));

        let patch = json!({"owner": null, "ticket": 42, "last_rejection": "peer failed"});
        meta.apply_patch(patch.as_object().unwrap()).unwrap();

        assert!(!meta.extra.contains_key("owner"));
        assert_eq!(meta.extra.get("ticket"), Some(&json!(42)));
        assert_eq!(meta.last_rejection.as_deref(), Some("peer failed"));
    }

    #[test]
    fn invalid_typed_patch_leaves_metadata_untouched() {
        let mut meta = TaskMetadata::default();
        meta.lane = Some(Lane::Interactive);

        let patch = json!({"lane": "urgent-ish"});
        assert!(meta.apply_patch(patch.as_object().unwrap()).is_err());
        assert_eq!(meta.lane, Some(Lane::Interactive));
    }
}
