//! Agent executor contract and the shell-command implementation.
//!
//! The dispatcher hands each leased task to an `AgentExecutor` and waits for
//! an `ExecutionReport`. `CommandExecutor` runs the configured `agent_cmd`
//! through `sh -c`, writes the task as JSON on stdin and reads the report from
//! the last non-empty stdout line.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use autopilot_core::{Task, VerificationEvidence};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between "still running" log lines for long agent runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on waiting for pipes to drain after the process exits.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("timeout after {0} seconds")]
    Timeout(u64),
    #[error("agent exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },
    #[error("agent produced no report")]
    MissingReport,
    #[error("invalid agent report: {0}")]
    InvalidReport(String),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

fn default_completed() -> bool {
    true
}

/// What an agent hands back when it finishes a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// False when the agent gave up; the task is moved to `blocked`.
    #[serde(default = "default_completed")]
    pub completed: bool,
    #[serde(flatten)]
    pub evidence: VerificationEvidence,
}

impl ExecutionReport {
    pub fn completed(evidence: VerificationEvidence) -> Self {
        Self {
            completed: true,
            evidence,
        }
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run `task` to completion or until `cancel` fires.
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<ExecutionReport>;
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    timeout: Duration,
}

enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

async fn read_bounded<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "agent output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }
    Ok(buf)
}

async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "agent output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "agent output task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "agent output capture timed out");
            Vec::new()
        }
    }
}

/// Parse the last non-empty line of `stdout` as an `ExecutionReport`.
pub fn parse_report(stdout: &str) -> Result<ExecutionReport> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(ExecutorError::MissingReport)?;
    serde_json::from_str(line).map_err(|e| ExecutorError::InvalidReport(e.to_string()))
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<ExecutionReport> {
        let input = serde_json::to_vec(task)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("AUTOPILOT_TASK_ID", &task.id.0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(task_id = %task.id, command = %self.command, "spawned agent process");

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(&input).await {
                warn!(task_id = %task.id, error = %err, "failed to write task to agent stdin");
            }
        }

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let outcome = loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(
                    task_id = %task.id,
                    timeout_sec = self.timeout.as_secs(),
                    "agent timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(task_id = %task.id, error = %err, "failed to kill timed-out agent");
                }
                break ProcessOutcome::TimedOut;
            }

            tokio::select! {
                result = child.wait() => break ProcessOutcome::Completed(result?),
                () = cancel.cancelled() => {
                    info!(task_id = %task.id, "cancellation requested; killing agent");
                    if let Err(err) = child.kill().await {
                        warn!(task_id = %task.id, error = %err, "failed to kill cancelled agent");
                    }
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    info!(
                        task_id = %task.id,
                        elapsed_sec = started.elapsed().as_secs(),
                        "agent still running"
                    );
                }
            }
        };

        let stdout = collect(stdout_task, "stdout").await;
        let stderr = collect(stderr_task, "stderr").await;
        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);

        match outcome {
            ProcessOutcome::TimedOut => Err(ExecutorError::Timeout(self.timeout.as_secs())),
            ProcessOutcome::Cancelled => Err(ExecutorError::Cancelled),
            ProcessOutcome::Completed(status) => {
                let code = status.code().unwrap_or(-1);
                info!(
                    task_id = %task.id,
                    exit_code = code,
                    duration_ms = started.elapsed().as_millis() as u64,
                    output_bytes = stdout.len(),
                    "agent finished"
                );
                if code != 0 {
                    let tail = stderr.lines().rev().take(5).collect::<Vec<_>>();
                    let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
                    return Err(ExecutorError::ExitCode { code, stderr: tail });
                }
                parse_report(&stdout)
            }
        }
    }
}
