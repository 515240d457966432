//! HTTP surface
//!
//! axum router exposing the synchronous chat endpoint, the async task
//! endpoints, queue and GPU introspection, the redacted model registry,
//! and Prometheus metrics.

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::admission::{request_id_middleware, AdmissionControl, RequestId};
use crate::audit_logging::AuditLogger;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::gpu_probe::{GpuProbe, PressureLevel};
use crate::metrics;
use crate::queue::{
    CancelOutcome, ResultOutcome, TaskQueue, TaskSubmission,
};
use crate::registry::WorkerRegistry;
use crate::types::{ChatMessage, GatewayError, Priority};

/// Retry-after hint for a saturated queue.
const QUEUE_FULL_RETRY_SECS: u64 = 5;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<TaskQueue>,
    pub probe: Arc<GpuProbe>,
    pub registry: Arc<WorkerRegistry>,
    pub admission: Arc<AdmissionControl>,
    pub audit: AuditLogger,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/async/submit", post(submit_task))
        .route("/v1/async/submit-batch", post(submit_batch))
        .route("/v1/async/status/:task_id", get(task_status))
        .route("/v1/async/result/:task_id", get(task_result))
        .route("/v1/async/cancel/:task_id", delete(cancel_task))
        .route("/v1/async/batch/:batch_id", get(batch_status))
        .route("/v1/async/stats", get(queue_stats))
        .route("/v1/async/health", get(queue_health))
        .route("/v1/gpu/status", get(gpu_status))
        .route("/models", get(list_models))
        .route("/metrics", get(metrics_text))
        .route("/health", get(liveness))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Client identifier: `x-forwarded-for` when present, else the socket peer.
fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Gateway error rendered as an HTTP response with the taxonomy kind, the
/// request id, and a Retry-After header where the kind carries one.
struct ApiError {
    error: GatewayError,
    request_id: String,
}

impl ApiError {
    fn new(error: GatewayError, request_id: &str) -> Self {
        Self {
            error,
            request_id: request_id.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match &self.error {
            GatewayError::AgentUnknown(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RejectedFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackpressureRetry { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamBadResponse(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cancelled => StatusCode::CONFLICT,
            GatewayError::InternalInvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match &self.error {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::BackpressureRetry { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::RejectedFull | GatewayError::UpstreamUnavailable => {
                Some(QUEUE_FULL_RETRY_SECS)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "kind": self.error.kind(),
                "message": self.error.to_string(),
                "request_id": self.request_id,
            }
        });

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionBody {
    /// Accepted for OpenAI compatibility; routing is driven by agent_kind.
    #[serde(default)]
    #[allow(dead_code)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    agent_kind: Option<String>,
}

async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Response {
    if body.messages.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"kind": "bad_request", "message": "messages must not be empty", "request_id": request_id}})),
        )
            .into_response();
    }

    let client = client_ip(&headers, &addr);
    let ticket = match state.admission.admit(
        &request_id,
        &client,
        body.agent_kind.as_deref(),
        &body.messages,
        body.max_tokens,
    ) {
        Ok(ticket) => ticket,
        Err(err) => {
            metrics::record_chat_request(err.kind());
            return ApiError::new(err, &request_id).into_response();
        }
    };

    let outcome = state
        .dispatcher
        .chat(
            ticket.agent_kind,
            &body.messages,
            body.temperature,
            ticket.max_tokens,
            None,
            &request_id,
        )
        .await;

    match outcome {
        Ok(outcome) => {
            metrics::record_chat_request("success");
            let _ = state.audit.log_dispatch(
                &request_id,
                Some(ticket.client),
                ticket.agent_kind.as_str(),
                &ticket.message_digest,
                Some(outcome.model_used.clone()),
                "success",
            );
            Json(outcome.response).into_response()
        }
        Err(err) => {
            metrics::record_chat_request(err.kind());
            let _ = state.audit.log_dispatch(
                &request_id,
                Some(ticket.client),
                ticket.agent_kind.as_str(),
                &ticket.message_digest,
                None,
                err.kind(),
            );
            ApiError::new(err, &request_id).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitTaskBody {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    agent_kind: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: String,
    status: &'static str,
    position: usize,
    estimated_wait_ms: u64,
}

/// Stages 2-5 for one task body; empty-message checks happen before this.
fn admit_submission(
    state: &AppState,
    request_id: &str,
    client: &str,
    body: SubmitTaskBody,
) -> Result<TaskSubmission, GatewayError> {
    let ticket = state.admission.admit(
        request_id,
        client,
        body.agent_kind.as_deref(),
        &body.messages,
        body.max_tokens,
    )?;

    Ok(TaskSubmission {
        agent_kind: ticket.agent_kind,
        messages: body.messages,
        priority: body.priority.unwrap_or_default(),
        temperature: body.temperature,
        max_tokens: ticket.max_tokens,
        deadline_ms: body.deadline_ms,
        request_id: request_id.to_string(),
    })
}

async fn submit_task(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<SubmitTaskBody>,
) -> Response {
    if body.messages.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"kind": "bad_request", "message": "messages must not be empty", "request_id": request_id}})),
        )
            .into_response();
    }

    let client = client_ip(&headers, &addr);
    let submission = match admit_submission(&state, &request_id, &client, body) {
        Ok(submission) => submission,
        Err(err) => return ApiError::new(err, &request_id).into_response(),
    };

    match state.queue.submit(submission) {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                task_id: receipt.task_id,
                status: "queued",
                position: receipt.position,
                estimated_wait_ms: receipt.estimated_wait_ms,
            }),
        )
            .into_response(),
        Err(err) => ApiError::new(err, &request_id).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBatchBody {
    tasks: Vec<SubmitTaskBody>,
}

async fn submit_batch(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<SubmitBatchBody>,
) -> Response {
    if body.tasks.is_empty() || body.tasks.iter().any(|task| task.messages.is_empty()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"kind": "bad_request", "message": "batch must carry non-empty tasks", "request_id": request_id}})),
        )
            .into_response();
    }

    let client = client_ip(&headers, &addr);
    let mut submissions = Vec::with_capacity(body.tasks.len());
    for task in body.tasks {
        match admit_submission(&state, &request_id, &client, task) {
            Ok(submission) => submissions.push(submission),
            Err(err) => return ApiError::new(err, &request_id).into_response(),
        }
    }

    match state.queue.submit_batch(submissions) {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(err) => ApiError::new(err, &request_id).into_response(),
    }
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    match state.queue.status(&task_id) {
        Some(view) => Json(view).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"kind": "not_found", "message": "unknown task_id"}})),
        )
            .into_response(),
    }
}

async fn task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    match state.queue.result(&task_id) {
        ResultOutcome::Ready(Ok(response)) => Json(json!({
            "task_id": task_id,
            "status": "completed",
            "result": response,
        }))
        .into_response(),
        ResultOutcome::Ready(Err(err)) => Json(json!({
            "task_id": task_id,
            "status": "failed",
            "error": {"kind": err.kind(), "message": err.to_string()},
        }))
        .into_response(),
        ResultOutcome::NotReady => (
            StatusCode::CONFLICT,
            Json(json!({"error": {"kind": "not_ready", "message": "task has not completed"}})),
        )
            .into_response(),
        ResultOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"kind": "not_found", "message": "unknown task_id"}})),
        )
            .into_response(),
        ResultOutcome::Expired => (
            StatusCode::GONE,
            Json(json!({"error": {"kind": "expired", "message": "result TTL elapsed"}})),
        )
            .into_response(),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    match state.queue.cancel(&task_id) {
        CancelOutcome::Cancelled => Json(json!({
            "task_id": task_id,
            "status": "cancelled",
        }))
        .into_response(),
        CancelOutcome::TooLate => (
            StatusCode::CONFLICT,
            Json(json!({"error": {"kind": "too_late", "message": "task is already processing or finished"}})),
        )
            .into_response(),
        CancelOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"kind": "not_found", "message": "unknown task_id"}})),
        )
            .into_response(),
    }
}

async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Response {
    match state.queue.batch_status(&batch_id) {
        Some(view) => Json(view).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"kind": "not_found", "message": "unknown batch_id"}})),
        )
            .into_response(),
    }
}

async fn queue_stats(State(state): State<AppState>) -> Response {
    Json(state.queue.stats()).into_response()
}

async fn queue_health(State(state): State<AppState>) -> Response {
    Json(json!({"status": state.queue.health()})).into_response()
}

#[derive(Debug, Serialize)]
struct GpuDeviceStatus {
    #[serde(flatten)]
    metric: crate::gpu_probe::GpuMetric,
    pressure: PressureLevel,
}

async fn gpu_status(State(state): State<AppState>) -> Response {
    let devices: Vec<GpuDeviceStatus> = state
        .probe
        .snapshot()
        .into_iter()
        .map(|metric| GpuDeviceStatus {
            pressure: PressureLevel::classify(&metric),
            metric,
        })
        .collect();

    Json(json!({"devices": devices})).into_response()
}

async fn list_models(State(state): State<AppState>) -> Response {
    Json(json!({
        "object": "list",
        "data": state.registry.public_view(),
    }))
    .into_response()
}

async fn metrics_text() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}

async fn liveness() -> Response {
    Json(json!({"status": "ok"})).into_response()
}
