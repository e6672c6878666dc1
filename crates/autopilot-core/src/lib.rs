pub mod config;
pub mod critic;
pub mod events;
pub mod metadata;
pub mod plan;
pub mod types;

pub use config::Config;
pub use critic::{CheckOutcome, CriticAuthority, CriticResult, PeerReview, VerificationEvidence};
pub use metadata::{
    remediation_key, Escalation, RemediationMetadata, RemediationScope, TaskMetadata,
};
pub use plan::{review_plan, PlanProposal, PlanReview};
pub use types::*;
