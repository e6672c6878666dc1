//! SQLite storage module for the control-plane daemon.
//!
//! Raw persistence for tasks, the event log, decisions, critic history and the
//! other append-only audit tables. Lifecycle rules live in `store`; this layer
//! only reads and writes rows.

use std::path::Path;

use autopilot_core::{
    Checkpoint, ContextEntry, ContextEntryType, CriticHistoryRecord, DecisionRecord, Event, Id,
    QualityMetric, Task, TaskMetadata, TaskStatus,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;

/// Explicit column list for task queries. Dependencies are folded into one
/// comma-separated column so a task list is a single round trip.
const TASK_COLUMNS: &str = "t.id, t.title, t.description, t.task_type, t.status, \
    t.assigned_to, t.metadata_json, t.parent_id, t.epic_id, t.milestone_id, t.created_at, \
    t.updated_at, t.started_at, t.completed_at, \
    (SELECT group_concat(d.depends_on, ',') FROM task_dependencies d WHERE d.task_id = t.id) \
    AS depends_on";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Run the compiled-in schema. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Task operations ---

    /// Insert a task, its dependency edges and its creation event atomically.
    pub async fn insert_task(&self, task: &Task, event: &Event) -> Result<()> {
        let metadata_json = serde_json::to_string(&task.metadata)?;
        let data_json = serde_json::to_string(&event.data)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO tasks (id, title, description, task_type, status, assigned_to,
                               metadata_json, remediation_key, parent_id, epic_id, milestone_id,
                               created_at, updated_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ",
        )
        .bind(task.id.as_ref())
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(&task.assigned_to)
        .bind(&metadata_json)
        .bind(task.metadata.remediation_key())
        .bind(task.parent_id.as_ref().map(AsRef::as_ref))
        .bind(task.epic_id.as_ref().map(AsRef::as_ref))
        .bind(task.milestone_id.as_ref().map(AsRef::as_ref))
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(task.completed_at.map(|t| t.timestamp_millis()))
        .execute(&mut *tx)
        .await?;

        for dependency in &task.depends_on {
            sqlx::query(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
            )
            .bind(task.id.as_ref())
            .bind(dependency.as_ref())
            .execute(&mut *tx)
            .await?;
        }

        event_insert(event, data_json).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &Id) -> Result<Task> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;

        row.into_task()
    }

    pub async fn task_exists(&self, id: &Id) -> Result<bool> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 > 0)
    }

    /// List tasks, optionally filtered by status, oldest first.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t WHERE t.status = ?1 \
                     ORDER BY t.created_at ASC, t.rowid ASC"
                );
                sqlx::query_as::<_, TaskRow>(&query)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t ORDER BY t.created_at ASC, t.rowid ASC"
                );
                sqlx::query_as::<_, TaskRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Pending tasks with every dependency done. A dependency that does not
    /// exist counts as not done.
    pub async fn ready_tasks(&self) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t WHERE t.status = 'pending' AND {DEPENDENCIES_DONE} \
             ORDER BY t.created_at ASC, t.rowid ASC"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Everything the dispatcher may act on, in one query: tasks awaiting
    /// review, tasks awaiting rework, and ready pending tasks.
    pub async fn scheduling_candidates(&self) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             WHERE t.status IN ('needs_review', 'needs_improvement') \
                OR (t.status = 'pending' AND {DEPENDENCIES_DONE}) \
             ORDER BY t.created_at ASC, t.rowid ASC"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// The open (not done) task carrying the given remediation key, if any.
    pub async fn find_open_remediation(&self, key: &str) -> Result<Option<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             WHERE t.remediation_key = ?1 AND t.status != 'done' \
             ORDER BY t.created_at ASC LIMIT 1"
        );
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Open remediation tasks scoped to a single critic.
    pub async fn count_open_critic_remediations(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE remediation_key LIKE 'critic:%' AND status != 'done'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    pub async fn count_open_remediations(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE remediation_key IS NOT NULL AND status != 'done'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    /// Task count per status.
    pub async fn status_counts(&self) -> Result<Vec<(String, usize)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(status, count)| (status, count as usize))
            .collect())
    }

    pub async fn is_correlation_applied(&self, correlation_id: &str) -> Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM applied_transitions WHERE correlation_id = ?1")
                .bind(correlation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }

    /// Write an updated task row, its event and the correlation record in one
    /// transaction. Returns `false` without writing anything if the correlation
    /// id was already applied.
    pub async fn commit_task_change(
        &self,
        task: &Task,
        correlation_id: &str,
        event: &Event,
    ) -> Result<bool> {
        let metadata_json = serde_json::to_string(&task.metadata)?;
        let data_json = serde_json::to_string(&event.data)?;
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "INSERT OR IGNORE INTO applied_transitions (correlation_id, task_id, applied_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(correlation_id)
        .bind(task.id.as_ref())
        .bind(event.timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, description = ?2, assigned_to = ?3, metadata_json = ?4, \
             remediation_key = ?5, updated_at = ?6, started_at = ?7, completed_at = ?8 \
             WHERE id = ?9",
        )
        .bind(task.status.as_str())
        .bind(&task.description)
        .bind(&task.assigned_to)
        .bind(&metadata_json)
        .bind(task.metadata.remediation_key())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(task.completed_at.map(|t| t.timestamp_millis()))
        .bind(task.id.as_ref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::TaskNotFound(task.id.to_string()));
        }

        event_insert(event, data_json).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    // --- Event operations ---

    /// Append an event to the audit log.
    pub async fn append_event(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;
        event_insert(event, data_json).execute(&self.pool).await?;
        Ok(())
    }

    /// List events in append order, for one task or for all.
    pub async fn list_events(&self, task_id: Option<&Id>) -> Result<Vec<Event>> {
        let rows = match task_id {
            Some(task_id) => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT id, task_id, type, agent, ts, data_json FROM events \
                     WHERE task_id = ?1 ORDER BY ts ASC, rowid ASC",
                )
                .bind(task_id.as_ref())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, EventRow>(
                    "SELECT id, task_id, type, agent, ts, data_json FROM events \
                     ORDER BY ts ASC, rowid ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(EventRow::into_event).collect()
    }

    // --- Decision operations ---

    pub async fn insert_decision(&self, decision: &DecisionRecord) -> Result<()> {
        let verdicts_json = serde_json::to_string(&decision.verdicts)?;
        sqlx::query(
            r"
            INSERT INTO decisions (id, task_id, gate_name, verdicts_json, consensus, reasoning,
                                   attempt, evidence_digest, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(decision.id.as_ref())
        .bind(decision.task_id.as_ref())
        .bind(&decision.gate_name)
        .bind(&verdicts_json)
        .bind(decision.consensus)
        .bind(&decision.reasoning)
        .bind(i64::from(decision.attempt))
        .bind(&decision.evidence_digest)
        .bind(decision.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Decisions for a task, oldest first.
    pub async fn list_decisions(&self, task_id: &Id) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query_as::<_, DecisionRow>(
            "SELECT id, task_id, gate_name, verdicts_json, consensus, reasoning, attempt, \
             evidence_digest, ts FROM decisions WHERE task_id = ?1 ORDER BY ts ASC, rowid ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DecisionRow::into_decision).collect()
    }

    // --- Quality metrics ---

    pub async fn insert_quality_metric(&self, metric: &QualityMetric) -> Result<()> {
        sqlx::query(
            "INSERT INTO quality_metrics (task_id, dimension, score, ts) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(metric.task_id.as_ref())
        .bind(&metric.dimension)
        .bind(metric.score)
        .bind(metric.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_quality_metrics(&self, task_id: &Id) -> Result<Vec<QualityMetric>> {
        let rows: Vec<(String, String, f64, i64)> = sqlx::query_as(
            "SELECT task_id, dimension, score, ts FROM quality_metrics \
             WHERE task_id = ?1 ORDER BY id ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(task_id, dimension, score, ts)| QualityMetric {
                task_id: Id::from_string(task_id),
                dimension,
                score,
                timestamp: from_millis(ts),
            })
            .collect())
    }

    // --- Context entries ---

    pub async fn insert_context_entry(&self, entry: &ContextEntry) -> Result<()> {
        let related_json = serde_json::to_string(&entry.related_tasks)?;
        sqlx::query(
            r"
            INSERT INTO context_entries (id, entry_type, topic, content, related_tasks_json,
                                         confidence, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(entry.id.as_ref())
        .bind(entry.entry_type.as_str())
        .bind(&entry.topic)
        .bind(&entry.content)
        .bind(&related_json)
        .bind(entry.confidence)
        .bind(entry.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_context_entries(&self, topic: Option<&str>) -> Result<Vec<ContextEntry>> {
        let rows = match topic {
            Some(topic) => {
                sqlx::query_as::<_, ContextRow>(
                    "SELECT id, entry_type, topic, content, related_tasks_json, confidence, ts \
                     FROM context_entries WHERE topic = ?1 ORDER BY ts ASC, rowid ASC",
                )
                .bind(topic)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ContextRow>(
                    "SELECT id, entry_type, topic, content, related_tasks_json, confidence, ts \
                     FROM context_entries ORDER BY ts ASC, rowid ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(ContextRow::into_entry).collect()
    }

    // --- Critic history ---

    pub async fn insert_critic_record(&self, record: &CriticHistoryRecord) -> Result<()> {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        sqlx::query(
            "INSERT INTO critic_history (critic_name, passed, ts, origin, metadata_json) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&record.critic_name)
        .bind(record.passed)
        .bind(record.timestamp.timestamp_millis())
        .bind(&record.origin)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent `limit` records for a critic, newest first.
    pub async fn critic_history(
        &self,
        critic_name: &str,
        origin: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CriticHistoryRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match origin {
            Some(origin) => {
                sqlx::query_as::<_, CriticRow>(
                    "SELECT critic_name, passed, ts, origin, metadata_json FROM critic_history \
                     WHERE critic_name = ?1 AND origin = ?2 ORDER BY ts DESC, id DESC LIMIT ?3",
                )
                .bind(critic_name)
                .bind(origin)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CriticRow>(
                    "SELECT critic_name, passed, ts, origin, metadata_json FROM critic_history \
                     WHERE critic_name = ?1 ORDER BY ts DESC, id DESC LIMIT ?2",
                )
                .bind(critic_name)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(CriticRow::into_record).collect()
    }

    /// Distinct critic names with at least one record for `origin`.
    pub async fn critic_names(&self, origin: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT critic_name FROM critic_history \
             WHERE origin = ?1 ORDER BY critic_name",
        )
        .bind(origin)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    // --- Checkpoints ---

    pub async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let state_json = serde_json::to_string(&checkpoint.state)?;
        sqlx::query(
            "INSERT INTO checkpoints (id, task_id, label, state_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(checkpoint.id.as_ref())
        .bind(checkpoint.task_id.as_ref())
        .bind(&checkpoint.label)
        .bind(&state_json)
        .bind(checkpoint.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_checkpoint(&self, task_id: &Id) -> Result<Option<Checkpoint>> {
        let row: Option<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, task_id, label, state_json, created_at FROM checkpoints \
             WHERE task_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(task_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, task_id, label, state_json, created_at)| {
            Ok(Checkpoint {
                id: Id::from_string(id),
                task_id: Id::from_string(task_id),
                label,
                state: serde_json::from_str(&state_json)?,
                created_at: from_millis(created_at),
            })
        })
        .transpose()
    }
}

/// Every dependency of `t` exists and is done.
const DEPENDENCIES_DONE: &str = "NOT EXISTS (\
    SELECT 1 FROM task_dependencies d LEFT JOIN tasks dt ON dt.id = d.depends_on \
    WHERE d.task_id = t.id AND (dt.status IS NULL OR dt.status != 'done'))";

fn event_insert(
    event: &Event,
    data_json: String,
) -> sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO events (id, task_id, type, agent, ts, data_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(event.id.as_ref())
    .bind(event.task_id.as_ref().map(AsRef::as_ref))
    .bind(&event.event_type)
    .bind(&event.agent)
    .bind(event.timestamp.timestamp_millis())
    .bind(data_json)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    title: String,
    description: String,
    task_type: String,
    status: String,
    assigned_to: Option<String>,
    metadata_json: String,
    parent_id: Option<String>,
    epic_id: Option<String>,
    milestone_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    depends_on: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = self
            .status
            .parse()
            .unwrap_or(TaskStatus::Blocked);
        let metadata: TaskMetadata = serde_json::from_str(&self.metadata_json)?;
        let depends_on = self
            .depends_on
            .as_deref()
            .map(|deps| {
                deps.split(',')
                    .filter(|d| !d.is_empty())
                    .map(Id::from_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Task {
            id: Id::from_string(self.id),
            title: self.title,
            description: self.description,
            task_type: self.task_type,
            status,
            assigned_to: self.assigned_to,
            metadata,
            parent_id: self.parent_id.map(Id::from_string),
            epic_id: self.epic_id.map(Id::from_string),
            milestone_id: self.milestone_id.map(Id::from_string),
            depends_on,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    task_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    agent: Option<String>,
    ts: i64,
    data_json: String,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: Id::from_string(self.id),
            timestamp: from_millis(self.ts),
            event_type: self.event_type,
            task_id: self.task_id.map(Id::from_string),
            agent: self.agent,
            data: serde_json::from_str(&self.data_json)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DecisionRow {
    id: String,
    task_id: String,
    gate_name: String,
    verdicts_json: String,
    consensus: bool,
    reasoning: String,
    attempt: i64,
    evidence_digest: Option<String>,
    ts: i64,
}

impl DecisionRow {
    fn into_decision(self) -> Result<DecisionRecord> {
        Ok(DecisionRecord {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            gate_name: self.gate_name,
            verdicts: serde_json::from_str(&self.verdicts_json)?,
            consensus: self.consensus,
            reasoning: self.reasoning,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            evidence_digest: self.evidence_digest,
            timestamp: from_millis(self.ts),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ContextRow {
    id: String,
    entry_type: String,
    topic: String,
    content: String,
    related_tasks_json: String,
    confidence: Option<f64>,
    ts: i64,
}

impl ContextRow {
    fn into_entry(self) -> Result<ContextEntry> {
        Ok(ContextEntry {
            id: Id::from_string(self.id),
            entry_type: self
                .entry_type
                .parse()
                .unwrap_or(ContextEntryType::Learning),
            topic: self.topic,
            content: self.content,
            related_tasks: serde_json::from_str(&self.related_tasks_json)?,
            confidence: self.confidence,
            timestamp: from_millis(self.ts),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CriticRow {
    critic_name: String,
    passed: bool,
    ts: i64,
    origin: String,
    metadata_json: String,
}

impl CriticRow {
    fn into_record(self) -> Result<CriticHistoryRecord> {
        Ok(CriticHistoryRecord {
            critic_name: self.critic_name,
            passed: self.passed,
            timestamp: from_millis(self.ts),
            origin: self.origin,
            metadata: serde_json::from_str(&self.metadata_json)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_core::events::{EventPayload, EventType, TaskCreatedPayload};
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir,
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn create_test_task(title: &str, status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: Id::new(),
            title: title.to_string(),
            description: String::new(),
            task_type: "feature".to_string(),
            status,
            assigned_to: None,
            metadata: TaskMetadata::default(),
            parent_id: None,
            epic_id: None,
            milestone_id: None,
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn created_event(task: &Task) -> Event {
        let payload = EventPayload::TaskCreated(TaskCreatedPayload {
            title: task.title.clone(),
            task_type: task.task_type.clone(),
            revision_of: None,
        });
        Event {
            id: Id::new(),
            timestamp: Utc::now(),
            event_type: EventType::TaskCreated.as_str().to_string(),
            task_id: Some(task.id.clone()),
            agent: None,
            data: payload.to_value().unwrap(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_task() {
        let ts = create_test_storage().await;
        let task = create_test_task("write parser", TaskStatus::Pending);

        ts.storage.insert_task(&task, &created_event(&task)).await.unwrap();
        let retrieved = ts.storage.get_task(&task.id).await.unwrap();

        assert_eq!(retrieved.id, task.id);
        assert_eq!(retrieved.title, "write parser");
        assert_eq!(retrieved.status, TaskStatus::Pending);

        let events = ts.storage.list_events(Some(&task.id)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "TASK_CREATED");
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();

        let task = create_test_task("still works", TaskStatus::Pending);
        ts.storage.insert_task(&task, &created_event(&task)).await.unwrap();
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_task(&Id::new()).await;
        assert!(matches!(result, Err(StorageError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn commit_task_change_skips_applied_correlation() {
        let ts = create_test_storage().await;
        let mut task = create_test_task("t", TaskStatus::Pending);
        ts.storage.insert_task(&task, &created_event(&task)).await.unwrap();

        task.status = TaskStatus::InProgress;
        let event = created_event(&task);
        assert!(ts.storage.commit_task_change(&task, "c-1", &event).await.unwrap());

        task.status = TaskStatus::Blocked;
        let event = Event { id: Id::new(), ..event };
        assert!(!ts.storage.commit_task_change(&task, "c-1", &event).await.unwrap());

        let stored = ts.storage.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(ts.storage.list_events(Some(&task.id)).await.unwrap().len(), 2);
        assert!(ts.storage.is_correlation_applied("c-1").await.unwrap());
    }

    #[tokio::test]
    async fn scheduling_candidates_respects_dependencies() {
        let ts = create_test_storage().await;
        let dep = create_test_task("dep", TaskStatus::InProgress);
        let mut blocked_by_dep = create_test_task("waits", TaskStatus::Pending);
        blocked_by_dep.depends_on = vec![dep.id.clone()];
        let free = create_test_task("free", TaskStatus::Pending);
        let review = create_test_task("review", TaskStatus::NeedsReview);
        let rework = create_test_task("rework", TaskStatus::NeedsImprovement);
        let done = create_test_task("done", TaskStatus::Done);

        for task in [&dep, &blocked_by_dep, &free, &review, &rework, &done] {
            ts.storage.insert_task(task, &created_event(task)).await.unwrap();
        }

        let titles: Vec<String> = ts
            .storage
            .scheduling_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["free", "review", "rework"]);

        let ready: Vec<String> = ts
            .storage
            .ready_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(ready, vec!["free"]);

        let waits = ts.storage.get_task(&blocked_by_dep.id).await.unwrap();
        assert_eq!(waits.depends_on, vec![dep.id]);
    }

    #[tokio::test]
    async fn critic_history_is_newest_first_and_filtered() {
        let ts = create_test_storage().await;
        let base = Utc::now();
        for (offset, passed, origin) in [
            (0, false, "runtime"),
            (1, true, "runtime"),
            (2, false, "test"),
            (3, true, "runtime"),
        ] {
            let record = CriticHistoryRecord {
                critic_name: "build".to_string(),
                passed,
                timestamp: base + chrono::Duration::seconds(offset),
                origin: origin.to_string(),
                metadata: serde_json::json!({}),
            };
            ts.storage.insert_critic_record(&record).await.unwrap();
        }

        let history = ts
            .storage
            .critic_history("build", Some("runtime"), 2)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp > history[1].timestamp);
        assert!(history.iter().all(|r| r.origin == "runtime"));

        let all = ts.storage.critic_history("build", None, 10).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(ts.storage.critic_names("runtime").await.unwrap(), vec!["build"]);
    }

    #[tokio::test]
    async fn latest_checkpoint_returns_newest() {
        let ts = create_test_storage().await;
        let task_id = Id::new();
        let base = Utc::now();
        for (offset, label) in [(0, "first"), (5, "second")] {
            let checkpoint = Checkpoint {
                id: Id::new(),
                task_id: task_id.clone(),
                label: label.to_string(),
                state: serde_json::json!({"step": offset}),
                created_at: base + chrono::Duration::seconds(offset),
            };
            ts.storage.insert_checkpoint(&checkpoint).await.unwrap();
        }

        let latest = ts.storage.latest_checkpoint(&task_id).await.unwrap().unwrap();
        assert_eq!(latest.label, "second");
        assert!(ts.storage.latest_checkpoint(&Id::new()).await.unwrap().is_none());
    }
}
