//! Plan proposals and the pre-execution completeness review.
//!
//! The review is deterministic: it checks that a plan carries the fields an
//! executor needs to verify and undo its work. It never judges plan quality.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const VERIFICATION_PLAN: &str = "verification_plan";
pub const ROLLBACK_PLAN: &str = "rollback_plan";

/// Error type for plan loading.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("invalid plan yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid plan json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// A structured plan submitted before work starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanProposal {
    pub title: String,
    pub description: String,
    pub affected_files: Vec<String>,
    pub complexity: Complexity,
    /// Free-form answers keyed by question. `verification_plan` and
    /// `rollback_plan` are required.
    pub answers: BTreeMap<String, String>,
}

impl PlanProposal {
    /// Load a plan from disk. `.json` files are parsed as JSON, everything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self, PlanError> {
        let content = fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, PlanError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn answer(&self, key: &str) -> Option<&str> {
        self.answers
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// Outcome of a plan review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReview {
    pub approved: bool,
    pub concerns: Vec<String>,
}

/// Review a plan for completeness.
///
/// Blocking concerns: empty title, missing verification plan, missing rollback
/// plan. A high-complexity plan with no affected files is flagged but does not
/// block approval.
pub fn review_plan(plan: &PlanProposal) -> PlanReview {
    let mut concerns = Vec::new();
    let mut blocking = false;

    if plan.title.trim().is_empty() {
        concerns.push("plan title is empty".to_string());
        blocking = true;
    }
    if plan.answer(VERIFICATION_PLAN).is_none() {
        concerns.push(
            "missing verification plan: describe how the change will be verified".to_string(),
        );
        blocking = true;
    }
    if plan.answer(ROLLBACK_PLAN).is_none() {
        concerns.push("missing rollback plan: describe how the change can be reverted".to_string());
        blocking = true;
    }
    if plan.complexity == Complexity::High && plan.affected_files.is_empty() {
        concerns.push("high complexity plan lists no affected files".to_string());
    }

    PlanReview {
        approved: !blocking,
        concerns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_plan() -> PlanProposal {
        PlanProposal {
            title: "Add retry to fetcher".to_string(),
            description: "Wrap network calls in bounded retry".to_string(),
            affected_files: vec!["src/fetch.rs".to_string()],
            complexity: Complexity::Medium,
            answers: BTreeMap::from([
                (VERIFICATION_PLAN.to_string(), "unit tests for retry path".to_string()),
                (ROLLBACK_PLAN.to_string(), "revert the commit".to_string()),
            ]),
        }
    }

    #[test]
    fn complete_plan_is_approved() {
        let review = review_plan(&complete_plan());
        assert!(review.approved);
        assert!(review.concerns.is_empty());
    }

    #[test]
    fn empty_rollback_plan_is_rejected() {
        let mut plan = complete_plan();
        plan.answers.insert(ROLLBACK_PLAN.to_string(), "   ".to_string());

        let review = review_plan(&plan);
        assert!(!review.approved);
        assert_eq!(review.concerns.len(), 1);
        assert!(review.concerns[0].contains("rollback"));
    }

    #[test]
    fn missing_verification_plan_is_rejected() {
        let mut plan = complete_plan();
        plan.answers.remove(VERIFICATION_PLAN);

        let review = review_plan(&plan);
        assert!(!review.approved);
        assert!(review.concerns.iter().any(|c| c.contains("verification")));
    }

    #[test]
    fn high_complexity_without_files_is_advisory() {
        let mut plan = complete_plan();
        plan.complexity = Complexity::High;
        plan.affected_files.clear();

        let review = review_plan(&plan);
        assert!(review.approved);
        assert_eq!(review.concerns.len(), 1);
    }

    #[test]
    fn plan_loads_from_yaml() {
        let yaml = r"
title: Split scheduler lanes
complexity: high
affected_files:
  - src/scheduler.rs
answers:
  verification_plan: run the lane tests
  rollback_plan: revert
";
        let plan = PlanProposal::from_yaml(yaml).unwrap();
        assert_eq!(plan.complexity, Complexity::High);
        assert_eq!(plan.answer(ROLLBACK_PLAN), Some("revert"));
        assert!(review_plan(&plan).approved);
    }

    #[test]
    fn plan_file_extension_selects_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        fs::write(&path, r#"{"title": "x", "answers": {"verification_plan": "tests"}}"#).unwrap();

        let plan = PlanProposal::from_file(&path).unwrap();
        let review = review_plan(&plan);
        assert!(!review.approved);
        assert!(review.concerns.iter().any(|c| c.contains("rollback")));
    }
}
