//! HTTP control plane for autopilotd.
//!
//! Local-only REST API over the task store, quality gate, critic monitor and
//! dispatcher. Bound to 127.0.0.1 with an optional bearer token.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use autopilot_core::{
    ContextEntryType, CriticAuthority, CriticResult, Id, NewTask, PlanProposal, TaskStatus,
    VerificationEvidence,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::critic_monitor::{CriticMonitor, MonitorError};
use crate::dispatcher::{DispatchError, Dispatcher, DEFAULT_HOLDER};
use crate::lease::{Lease, LeaseError, LeaseManager};
use crate::notify::{EventBus, Subscription};
use crate::quality_gate::{GateError, QualityGate};
use crate::scheduler::{DispatchInput, Scheduler, SchedulerError};
use crate::store::{NewContextEntry, StoreError, TaskStore};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub scheduler: Arc<Scheduler>,
    pub leases: Arc<LeaseManager>,
    pub gate: Arc<QualityGate>,
    pub monitor: Arc<CriticMonitor>,
    /// Present only when an agent command is configured.
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/roadmap/health", get(roadmap_health))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/ready", get(ready_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/transition", post(transition_task))
        .route("/tasks/{id}/revision", post(create_revision))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/lease", post(acquire_lease))
        .route("/tasks/{id}/lease/renew", post(renew_lease))
        .route("/tasks/{id}/lease/release", post(release_lease))
        .route("/tasks/{id}/events", get(list_task_events))
        .route("/tasks/{id}/decisions", get(list_decisions))
        .route("/tasks/{id}/verify", post(verify_task))
        .route("/tasks/{id}/context", post(add_context))
        .route("/tasks/{id}/checkpoints", post(create_checkpoint))
        .route("/tasks/{id}/metrics", post(record_metric).get(list_metrics))
        .route("/plans/review", post(review_plan))
        .route("/critics/results", post(record_critic_result))
        .route("/critics/{name}/history", get(critic_history))
        .route("/critics/{name}/skip", get(critic_skip))
        .route("/dispatch", post(dispatch))
        .route("/events/stream", get(stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and serve until `cancel` fires.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn store_error(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidTransition { .. }
        | StoreError::NotTerminal { .. }
        | StoreError::Closed(_)
        | StoreError::DuplicateRemediation(_) => StatusCode::CONFLICT,
        StoreError::InvalidMetadata(_) | StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        StoreError::Storage(_) => {
            error!(error = %err, "storage failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, err.to_string())
}

fn gate_error(err: GateError) -> ApiError {
    match err {
        GateError::Store(e) => store_error(e),
        GateError::IncidentOpen(_) => api_error(StatusCode::CONFLICT, err.to_string()),
        GateError::Digest(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn scheduler_error(err: SchedulerError) -> ApiError {
    match err {
        SchedulerError::Store(e) => store_error(e),
        SchedulerError::AlreadyScheduled(_) => api_error(StatusCode::CONFLICT, err.to_string()),
        SchedulerError::NoSlot(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn dispatch_error(err: DispatchError) -> ApiError {
    match err {
        DispatchError::Store(e) => store_error(e),
        DispatchError::Scheduler(e) => scheduler_error(e),
        DispatchError::Gate(e) => gate_error(e),
    }
}

fn lease_error(err: LeaseError) -> ApiError {
    api_error(StatusCode::CONFLICT, err.to_string())
}

fn monitor_error(err: MonitorError) -> ApiError {
    match err {
        MonitorError::Store(e) => store_error(e),
        MonitorError::Encode(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store_version: u64,
    active_leases: usize,
    dispatcher: bool,
    scheduler: crate::scheduler::SchedulerSnapshot,
    audit: crate::metrics::AuditSnapshot,
}

/// Query params for GET /tasks.
#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
}

/// Request payload for POST /tasks/{id}/transition.
#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub to: TaskStatus,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    /// Generated when absent, which makes the call non-idempotent.
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Request payload for POST /tasks/{id}/lease.
#[derive(Debug, Deserialize)]
pub struct LeaseRequest {
    pub holder: String,
    /// Defaults to the configured lease TTL.
    #[serde(default)]
    pub ttl_sec: Option<u64>,
}

/// Request payload for lease renew and release.
#[derive(Debug, Deserialize)]
pub struct LeaseHolderRequest {
    pub holder: String,
}

#[derive(Debug, Serialize)]
struct LeaseResponse {
    task_id: Id,
    holder: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ttl_sec: u64,
}

impl From<Lease> for LeaseResponse {
    fn from(lease: Lease) -> Self {
        Self {
            expires_at: lease.expires_at(),
            ttl_sec: lease.ttl.as_secs(),
            task_id: lease.task_id,
            holder: lease.holder,
            acquired_at: lease.acquired_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub entry_type: ContextEntryType,
    pub topic: String,
    pub content: String,
    #[serde(default)]
    pub related_tasks: Vec<Id>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub label: String,
    #[serde(default)]
    pub state: Value,
}

#[derive(Debug, Deserialize)]
pub struct MetricRequest {
    pub dimension: String,
    pub score: f64,
}

#[derive(Debug, Deserialize)]
pub struct ReviewPlanRequest {
    #[serde(flatten)]
    pub plan: PlanProposal,
    #[serde(default)]
    pub task_id: Option<Id>,
}

#[derive(Debug, Deserialize)]
pub struct CriticResultRequest {
    #[serde(flatten)]
    pub result: CriticResult,
    /// Defaults to the monitored origin.
    #[serde(default)]
    pub origin: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CriticHistoryQuery {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CriticSkipQuery {
    #[serde(default)]
    pub authority: Option<CriticAuthority>,
}

#[derive(Debug, Serialize)]
struct DispatchResponse {
    lane: autopilot_core::Lane,
    tick: crate::dispatcher::TickReport,
}

// --- Handlers ---

async fn health_check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    Ok(Json(HealthResponse {
        status: "ok",
        store_version: state.store.version(),
        active_leases: state.leases.occupied_count(),
        dispatcher: state.dispatcher.is_some(),
        scheduler: state.scheduler.snapshot(),
        audit: state.store.audit().snapshot(),
    }))
}

async fn roadmap_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let health = state.store.get_roadmap_health().await.map_err(store_error)?;
    Ok(Json(health))
}

/// POST /tasks - Create a new task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task = state.store.create_task(req).await.map_err(store_error)?;
    info!(task_id = %task.id, title = %task.title, "created task");
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /tasks - List tasks, optionally filtered by status.
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let tasks = state.store.list_tasks(status).await.map_err(store_error)?;
    Ok(Json(tasks))
}

async fn ready_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let tasks = state.store.get_ready_tasks().await.map_err(store_error)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task = state
        .store
        .get_task(&Id::from_string(&id))
        .await
        .map_err(store_error)?;
    Ok(Json(task))
}

/// POST /tasks/{id}/transition - Move a task along a legal edge.
async fn transition_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task_id = Id::from_string(&id);
    let correlation_id = req
        .correlation_id
        .unwrap_or_else(|| format!("api:{task_id}:{}", Id::new()));
    let outcome = state
        .store
        .transition(
            &task_id,
            req.to,
            req.metadata.as_ref(),
            &correlation_id,
            req.agent.as_deref(),
        )
        .await
        .map_err(|e| {
            warn!(task_id = %task_id, error = %e, "transition rejected");
            store_error(e)
        })?;
    // Only `blocked` has an edge into `pending`: an operator unblock reopens the resolution loop.
    if outcome.applied && outcome.task.status == TaskStatus::Pending {
        state.gate.clear_incident(&task_id).await;
    }
    Ok(Json(outcome))
}

/// POST /tasks/{id}/revision - Open follow-up work on a done task.
async fn create_revision(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task = state
        .store
        .create_revision(&Id::from_string(&id), req)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// POST /tasks/{id}/cancel - Block a task and drop it from its lane or stop its run.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task_id = Id::from_string(&id);
    let outcome = match &state.dispatcher {
        Some(dispatcher) => dispatcher.cancel(&task_id).await.map_err(dispatch_error)?,
        None => state
            .scheduler
            .cancel(&task_id, DEFAULT_HOLDER)
            .await
            .map_err(scheduler_error)?,
    };
    // The dispatcher's own lease goes when its run reports back. External
    // holders find out on their next renew.
    if state
        .leases
        .get(&task_id)
        .is_some_and(|lease| lease.holder != DEFAULT_HOLDER)
    {
        state.leases.release_lease(&task_id);
    }
    info!(task_id = %task_id, ?outcome, "cancel requested");
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

/// POST /tasks/{id}/lease - Claim a task for an external agent.
async fn acquire_lease(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<LeaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    if req.holder.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "holder must not be empty"));
    }
    if req.ttl_sec == Some(0) {
        return Err(api_error(StatusCode::BAD_REQUEST, "ttl_sec must be positive"));
    }
    let task_id = Id::from_string(&id);
    let task = state.store.get_task(&task_id).await.map_err(store_error)?;
    if task.status.is_terminal() || task.status == TaskStatus::Blocked {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("task {} is {} and cannot be leased", task.id, task.status),
        ));
    }
    let ttl = req.ttl_sec.map(std::time::Duration::from_secs);
    let lease = state
        .leases
        .acquire_lease(&task_id, &req.holder, ttl)
        .map_err(lease_error)?;
    info!(task_id = %task_id, holder = %lease.holder, "external lease acquired");
    Ok((StatusCode::CREATED, Json(LeaseResponse::from(lease))))
}

/// POST /tasks/{id}/lease/renew - Heartbeat for a held lease.
async fn renew_lease(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<LeaseHolderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let lease = state
        .leases
        .renew(&Id::from_string(&id), &req.holder)
        .map_err(lease_error)?;
    Ok(Json(LeaseResponse::from(lease)))
}

/// POST /tasks/{id}/lease/release - Give a lease back.
async fn release_lease(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<LeaseHolderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let released = state
        .leases
        .release_held(&Id::from_string(&id), &req.holder)
        .map_err(lease_error)?;
    Ok(Json(serde_json::json!({ "released": released })))
}

async fn list_task_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task_id = Id::from_string(&id);
    state.store.get_task(&task_id).await.map_err(store_error)?;
    let events = state
        .store
        .list_events(Some(&task_id))
        .await
        .map_err(store_error)?;
    Ok(Json(events))
}

async fn list_decisions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task_id = Id::from_string(&id);
    state.store.get_task(&task_id).await.map_err(store_error)?;
    let decisions = state
        .store
        .list_decisions(&task_id)
        .await
        .map_err(store_error)?;
    Ok(Json(decisions))
}

/// POST /tasks/{id}/verify - Run the four-gate review on submitted evidence.
async fn verify_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(evidence): Json<VerificationEvidence>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let outcome = state
        .gate
        .verify(&Id::from_string(&id), &evidence)
        .await
        .map_err(gate_error)?;
    Ok(Json(outcome))
}

async fn add_context(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ContextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task_id = Id::from_string(&id);
    state.store.get_task(&task_id).await.map_err(store_error)?;
    let mut related_tasks = req.related_tasks;
    if !related_tasks.contains(&task_id) {
        related_tasks.insert(0, task_id);
    }
    let entry = state
        .store
        .add_context_entry(NewContextEntry {
            entry_type: req.entry_type,
            topic: req.topic,
            content: req.content,
            related_tasks,
            confidence: req.confidence,
        })
        .await;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn create_checkpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<CheckpointRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task_id = Id::from_string(&id);
    state.store.get_task(&task_id).await.map_err(store_error)?;
    let checkpoint = state
        .store
        .create_checkpoint(&task_id, &req.label, req.state)
        .await;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

async fn record_metric(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<MetricRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let task_id = Id::from_string(&id);
    state.store.get_task(&task_id).await.map_err(store_error)?;
    let metric = state
        .store
        .record_quality_metric(&task_id, &req.dimension, req.score)
        .await;
    Ok((StatusCode::CREATED, Json(metric)))
}

async fn list_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let metrics = state
        .store
        .list_quality_metrics(&Id::from_string(&id))
        .await
        .map_err(store_error)?;
    Ok(Json(metrics))
}

/// POST /plans/review - Check a plan before execution.
async fn review_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReviewPlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    if let Some(task_id) = &req.task_id {
        state.store.get_task(task_id).await.map_err(store_error)?;
    }
    let review = state.gate.review_plan(&req.plan, req.task_id.as_ref()).await;
    Ok(Json(review))
}

/// POST /critics/results - Record a critic run. Results under the monitored
/// origin are evaluated immediately.
async fn record_critic_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CriticResultRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    if req.result.critic_name.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "critic_name must not be empty"));
    }
    let monitored = &state.monitor.settings().origin;
    match req.origin {
        Some(origin) if &origin != monitored => {
            let record = state.store.record_critic_result(&req.result, &origin).await;
            Ok((StatusCode::CREATED, Json(serde_json::json!({ "record": record }))))
        }
        _ => {
            let evaluation = state
                .monitor
                .observe(&req.result)
                .await
                .map_err(monitor_error)?;
            Ok((
                StatusCode::CREATED,
                Json(serde_json::json!({ "evaluation": evaluation })),
            ))
        }
    }
}

async fn critic_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<CriticHistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let settings = state.monitor.settings();
    let origin = query.origin.unwrap_or_else(|| settings.origin.clone());
    let limit = query.limit.unwrap_or(settings.history_limit);
    let history = state
        .store
        .get_critic_history(&name, Some(&origin), limit)
        .await
        .map_err(store_error)?;
    let report = state.monitor.report(&name).await.map_err(monitor_error)?;
    Ok(Json(serde_json::json!({
        "critic": name,
        "origin": origin,
        "history": history,
        "report": report,
    })))
}

async fn critic_skip(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<CriticSkipQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let decision = state
        .monitor
        .should_skip(&name, query.authority.unwrap_or_default())
        .await
        .map_err(monitor_error)?;
    Ok(Json(decision))
}

/// POST /dispatch - Enqueue a task and run a dispatch tick.
async fn dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<DispatchInput>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let Some(dispatcher) = &state.dispatcher else {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no agent_cmd configured; tasks are worked by external agents",
        ));
    };
    let task = state
        .store
        .get_task(&input.task_id)
        .await
        .map_err(store_error)?;
    if task.status.is_terminal() || task.status == TaskStatus::Blocked {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("task {} is {} and cannot be dispatched", task.id, task.status),
        ));
    }
    let lane = state
        .scheduler
        .dispatch_task(&input)
        .map_err(scheduler_error)?;
    let tick = dispatcher.tick().await.map_err(dispatch_error)?;
    Ok((StatusCode::ACCEPTED, Json(DispatchResponse { lane, tick })))
}

/// An SSE client's subscription. Unsubscribes when the stream is dropped.
#[derive(Debug)]
struct StreamSubscription {
    bus: Arc<EventBus>,
    subscription: Subscription,
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription.id);
    }
}

/// GET /events/stream - Live store notifications (SSE).
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let bus = Arc::clone(state.store.bus());
    let subscription = StreamSubscription {
        subscription: bus.subscribe(),
        bus,
    };
    let stream = stream::unfold(subscription, |mut sub| async move {
        let notification = sub.subscription.receiver.recv().await?;
        let data = serde_json::to_string(&notification).unwrap_or_default();
        let event = SseEvent::default().event(notification.kind()).data(data);
        Some((Ok(event), sub))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
