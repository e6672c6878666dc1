//! Output rendering for the autopilotctl CLI.

use autopilot_core::{DecisionRecord, PlanReview, RoadmapHealth, Task, TaskStatus};

use crate::client::LeaseResponse;

pub fn print_task_created(task: &Task) {
    println!("Created task: {}", task.id);
    println!("  Title:  {}", task.title);
    println!("  Type:   {}", task.task_type);
    println!("  Status: {}", format_status(task.status));
    if !task.depends_on.is_empty() {
        println!("  Deps:   {}", join_ids(task));
    }
}

/// Print a list of tasks in tabular format.
pub fn print_task_list(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!(
        "{:<36}  {:<30}  {:<12}  {:<18}  {:<20}",
        "ID", "TITLE", "TYPE", "STATUS", "UPDATED"
    );
    println!("{}", "-".repeat(124));

    for task in tasks {
        println!(
            "{:<36}  {:<30}  {:<12}  {:<18}  {:<20}",
            task.id.0,
            truncate(&task.title, 30),
            truncate(&task.task_type, 12),
            format_status(task.status),
            format_time(&task.updated_at),
        );
    }

    println!();
    println!("{} task(s)", tasks.len());
}

pub fn print_task_details(task: &Task) {
    println!("Task: {}", task.id);
    println!();
    println!("  Title:          {}", task.title);
    println!("  Type:           {}", task.task_type);
    println!("  Status:         {}", format_status(task.status));
    if let Some(ref assignee) = task.assigned_to {
        println!("  Assigned To:    {assignee}");
    }
    if let Some(lane) = task.metadata.lane {
        println!("  Lane:           {}", lane.as_str());
    }
    if !task.description.is_empty() {
        println!("  Description:    {}", task.description);
    }
    if !task.depends_on.is_empty() {
        println!("  Depends On:     {}", join_ids(task));
    }
    if let Some(ref parent) = task.parent_id {
        println!("  Parent:         {parent}");
    }
    if let Some(ref revision_of) = task.metadata.revision_of {
        println!("  Revision Of:    {revision_of}");
    }

    if let Some(ref remediation) = task.metadata.remediation {
        println!();
        println!("  Remediation:");
        println!("    Key:          {}", remediation.key());
        println!("    Severity:     {}", remediation.severity.as_str());
        println!("    Failures:     {}", remediation.consecutive_failures);
    }
    if let Some(ref escalation) = task.metadata.escalation {
        println!();
        println!("  Escalation:");
        println!("    Reason:       {}", escalation.reason);
        println!("    Count:        {}", escalation.count);
        println!("    Note:         {}", escalation.note);
    }
    if let Some(ref rejection) = task.metadata.last_rejection {
        println!("  Last Rejection: {rejection}");
    }
    if let Some(ref resolution) = task.metadata.resolution {
        println!("  Resolution:     {resolution}");
    }

    println!();
    println!("  Created:        {}", format_time(&task.created_at));
    println!("  Updated:        {}", format_time(&task.updated_at));
    if let Some(ref started) = task.started_at {
        println!("  Started:        {}", format_time(started));
    }
    if let Some(ref completed) = task.completed_at {
        println!("  Completed:      {}", format_time(completed));
    }
}

pub fn print_health(health: &RoadmapHealth) {
    println!("Roadmap health");
    println!();
    println!("  Total:          {}", health.total);
    for status in TaskStatus::ALL {
        println!(
            "  {:<16}{}",
            format!("{}:", format_status(status)),
            health.count(status)
        );
    }
    println!();
    println!("  Completion:     {:.1}%", health.completion_pct);
    println!("  Blocked Ratio:  {:.2}", health.blocked_ratio);
    println!("  Remediation:    {} open", health.open_remediation);
}

pub fn print_decisions(decisions: &[DecisionRecord]) {
    if decisions.is_empty() {
        println!("No decisions recorded.");
        return;
    }

    for decision in decisions {
        println!(
            "#{} {} {} ({})",
            decision.attempt,
            decision.gate_name,
            if decision.consensus { "APPROVED" } else { "REJECTED" },
            format_time(&decision.timestamp),
        );
        for (gate, passed) in &decision.verdicts {
            println!("    {:<24}  {}", gate, if *passed { "pass" } else { "FAIL" });
        }
        if !decision.reasoning.is_empty() {
            println!("    {}", decision.reasoning);
        }
    }
}

pub fn print_lease(lease: &LeaseResponse) {
    println!("Lease on {} held by {}", lease.task_id, lease.holder);
    println!("  Acquired:       {}", format_time(&lease.acquired_at));
    println!("  Expires:        {} ({}s)", format_time(&lease.expires_at), lease.ttl_sec);
}

pub fn print_plan_review(review: &PlanReview) {
    println!(
        "Plan {}",
        if review.approved { "approved" } else { "rejected" }
    );
    for concern in &review.concerns {
        println!("  - {concern}");
    }
}

fn format_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "PENDING",
        TaskStatus::InProgress => "IN_PROGRESS",
        TaskStatus::NeedsReview => "NEEDS_REVIEW",
        TaskStatus::NeedsImprovement => "NEEDS_IMPROVEMENT",
        TaskStatus::Blocked => "BLOCKED",
        TaskStatus::Done => "DONE",
    }
}

fn join_ids(task: &Task) -> String {
    task.depends_on
        .iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
