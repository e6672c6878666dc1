//! Critic adapter contract.
//!
//! Critics are external reviewers (build, tests, security, ...). The control
//! plane only reads their name, verdict and run time; the rest is kept for
//! the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::types::ParseEnumError;

/// Result returned by a critic run. A crashed critic is reported as
/// `passed: false` with whatever output it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticResult {
    pub critic_name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CriticResult {
    pub fn new(critic_name: impl Into<String>, passed: bool) -> Self {
        Self {
            critic_name: critic_name.into(),
            passed,
            stdout: None,
            stderr: None,
            code: None,
            analysis: None,
            timestamp: Utc::now(),
        }
    }

    /// Failing result for a critic that could not be run at all.
    pub fn crashed(critic_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stderr: Some(error.into()),
            ..Self::new(critic_name, false)
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Short failure context for remediation descriptions.
    pub fn failure_context(&self) -> Option<String> {
        if self.passed {
            return None;
        }
        let text = self
            .stderr
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.stdout.as_deref())?;
        let line = text.lines().rev().find(|line| !line.trim().is_empty())?;
        Some(line.trim().chars().take(240).collect())
    }
}

/// How much weight a critic's verdict carries. Ordered from most to least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticAuthority {
    Critical,
    Blocking,
    #[default]
    Default,
    Advisory,
}

impl CriticAuthority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Blocking => "blocking",
            Self::Default => "default",
            Self::Advisory => "advisory",
        }
    }

    /// Critical and blocking critics always run.
    pub fn may_skip(self) -> bool {
        matches!(self, Self::Default | Self::Advisory)
    }
}

impl FromStr for CriticAuthority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "blocking" => Ok(Self::Blocking),
            "default" => Ok(Self::Default),
            "advisory" => Ok(Self::Advisory),
            _ => Err(ParseEnumError {
                kind: "critic authority",
                value: s.to_string(),
            }),
        }
    }
}

/// Outcome of one build or test command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOutcome {
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerReview {
    pub approved: bool,
    pub reviewer: String,
    pub notes: String,
}

/// Evidence an executor submits with a task for post-execution review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationEvidence {
    pub summary: String,
    pub build: Option<CheckOutcome>,
    pub tests: Option<CheckOutcome>,
    pub changed_files: Vec<String>,
    pub critic_results: Vec<CriticResult>,
    pub peer_review: Option<PeerReview>,
}

impl VerificationEvidence {
    pub fn failing_critics(&self) -> impl Iterator<Item = &CriticResult> {
        self.critic_results.iter().filter(|result| !result.passed)
    }

    /// SHA-256 of the serialized evidence, hex encoded.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self)?);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critic_result_accepts_minimal_adapter_payload() {
        let result: CriticResult =
            serde_json::from_str(r#"{"critic_name": "tests", "passed": true}"#).unwrap();
        assert_eq!(result.critic_name, "tests");
        assert!(result.passed);
        assert!(result.stdout.is_none());
    }

    #[test]
    fn failure_context_prefers_last_stderr_line() {
        let mut result = CriticResult::new("build", false);
        result.stdout = Some("compiling\n".to_string());
        result.stderr = Some("warning: x\nerror: linker failed\n\n".to_string());
        assert_eq!(result.failure_context().as_deref(), Some("error: linker failed"));

        assert!(CriticResult::new("build", true).failure_context().is_none());
    }

    #[test]
    fn digest_tracks_evidence_content() {
        let evidence = VerificationEvidence {
            summary: "added lane caps".to_string(),
            ..VerificationEvidence::default()
        };
        let digest = evidence.digest().unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, evidence.clone().digest().unwrap());

        let changed = VerificationEvidence {
            summary: "added lane caps and tests".to_string(),
            ..VerificationEvidence::default()
        };
        assert_ne!(digest, changed.digest().unwrap());
    }

    #[test]
    fn only_low_authority_critics_may_skip() {
        assert!(!CriticAuthority::Critical.may_skip());
        assert!(!CriticAuthority::Blocking.may_skip());
        assert!(CriticAuthority::Default.may_skip());
        assert!(CriticAuthority::Advisory.may_skip());
        assert_eq!("advisory".parse::<CriticAuthority>().unwrap(), CriticAuthority::Advisory);
    }
}
