//! HTTP client for the autopilotd daemon.

use autopilot_core::{
    CriticResult, DecisionRecord, Id, NewTask, PlanProposal, PlanReview, RoadmapHealth, Task,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(
        "daemon not running at {addr}\n  → start with: autopilotd\
         \n  → or set AUTOPILOT_ADDR if using a different address"
    )]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    TaskNotFound(String),

    #[error("rejected: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: check AUTOPILOT_AUTH_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("no dispatcher: {0}")]
    NoDispatcher(String),

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure autopilotd is running\
         \n  → check AUTOPILOT_AUTH_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /tasks/{id}/transition.
#[derive(Debug, Serialize)]
pub struct TransitionRequest {
    pub to: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// Response from the transition endpoint.
#[derive(Debug, Deserialize)]
pub struct TransitionResponse {
    pub task: Task,
    /// False when the correlation id was already applied.
    pub applied: bool,
}

#[derive(Debug, Serialize)]
struct ReviewPlanRequest<'a> {
    #[serde(flatten)]
    plan: &'a PlanProposal,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CriticResultRequest<'a> {
    #[serde(flatten)]
    result: &'a CriticResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    outcome: String,
}

#[derive(Debug, Serialize)]
struct LeaseRequest<'a> {
    holder: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    released: bool,
}

/// A lease held on a task, as reported by the daemon.
#[derive(Debug, Deserialize)]
pub struct LeaseResponse {
    pub task_id: Id,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_sec: u64,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for autopilotd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Check /health. `Ok(false)` means the daemon answered with a non-2xx status.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        Ok(response.status().is_success())
    }

    /// Wait for the daemon with exponential backoff (5s window, 200ms first delay).
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Err(ClientError::Unauthorized) => return Err(ClientError::Unauthorized),
                Ok(false) | Err(_) => {
                    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            400 => ClientError::InvalidInput(message),
            404 => ClientError::TaskNotFound(message),
            409 => ClientError::Conflict(message),
            503 => ClientError::NoDispatcher(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Self::decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// GET /tasks?status=...
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ClientError> {
        match status {
            Some(status) => self.get(&format!("/tasks?status={}", status.as_str())).await,
            None => self.get("/tasks").await,
        }
    }

    /// GET /tasks/{id}
    pub async fn get_task(&self, task_id: &str) -> Result<Task, ClientError> {
        self.get(&format!("/tasks/{task_id}")).await
    }

    /// POST /tasks
    pub async fn create_task(&self, task: &NewTask) -> Result<Task, ClientError> {
        self.post("/tasks", task).await
    }

    /// POST /tasks/{id}/transition
    pub async fn transition(
        &self,
        task_id: &str,
        req: &TransitionRequest,
    ) -> Result<TransitionResponse, ClientError> {
        self.post(&format!("/tasks/{task_id}/transition"), req).await
    }

    /// POST /tasks/{id}/cancel
    pub async fn cancel_task(&self, task_id: &str) -> Result<String, ClientError> {
        let body: CancelResponse = self
            .post(&format!("/tasks/{task_id}/cancel"), &serde_json::json!({}))
            .await?;
        Ok(body.outcome)
    }

    /// POST /tasks/{id}/lease
    pub async fn acquire_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl_sec: Option<u64>,
    ) -> Result<LeaseResponse, ClientError> {
        self.post(
            &format!("/tasks/{task_id}/lease"),
            &LeaseRequest { holder, ttl_sec },
        )
        .await
    }

    /// POST /tasks/{id}/lease/renew
    pub async fn renew_lease(
        &self,
        task_id: &str,
        holder: &str,
    ) -> Result<LeaseResponse, ClientError> {
        self.post(
            &format!("/tasks/{task_id}/lease/renew"),
            &LeaseRequest {
                holder,
                ttl_sec: None,
            },
        )
        .await
    }

    /// POST /tasks/{id}/lease/release. `Ok(false)` means no lease was held.
    pub async fn release_lease(&self, task_id: &str, holder: &str) -> Result<bool, ClientError> {
        let body: ReleaseResponse = self
            .post(
                &format!("/tasks/{task_id}/lease/release"),
                &LeaseRequest {
                    holder,
                    ttl_sec: None,
                },
            )
            .await?;
        Ok(body.released)
    }

    /// GET /tasks/ready
    pub async fn ready_tasks(&self) -> Result<Vec<Task>, ClientError> {
        self.get("/tasks/ready").await
    }

    /// GET /roadmap/health
    pub async fn roadmap_health(&self) -> Result<RoadmapHealth, ClientError> {
        self.get("/roadmap/health").await
    }

    /// GET /tasks/{id}/decisions
    pub async fn list_decisions(&self, task_id: &str) -> Result<Vec<DecisionRecord>, ClientError> {
        self.get(&format!("/tasks/{task_id}/decisions")).await
    }

    /// POST /plans/review
    pub async fn review_plan(
        &self,
        plan: &PlanProposal,
        task_id: Option<&str>,
    ) -> Result<PlanReview, ClientError> {
        self.post("/plans/review", &ReviewPlanRequest { plan, task_id })
            .await
    }

    /// POST /critics/results. Returns the daemon's evaluation or stored record.
    pub async fn record_critic_result(
        &self,
        result: &CriticResult,
        origin: Option<&str>,
    ) -> Result<serde_json::Value, ClientError> {
        self.post("/critics/results", &CriticResultRequest { result, origin })
            .await
    }
}
