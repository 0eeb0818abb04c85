//! HTTP control surface

use crate::bus::EventBus;
use crate::orchestrator::LaunchOrchestrator;
use crate::sse;
use crate::telemetry::SharedAggregator;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use modelhost_core::{
    BackendsConfig, EventCategory, EventPayload, MetricsSnapshot, RecipeId, RecipeStore,
    StatusSnapshot,
};
use modelhost_runtime::{EngineSupervisor, ProbeTarget, ReadinessOutcome, ReadinessProbe};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Everything the handlers need
#[derive(Clone)]
pub struct ApiState {
    pub bus: EventBus,
    pub orchestrator: LaunchOrchestrator,
    pub supervisor: Arc<dyn EngineSupervisor>,
    pub prober: Arc<dyn ReadinessProbe>,
    pub recipes: Arc<dyn RecipeStore>,
    pub aggregator: SharedAggregator,
    pub backends: BackendsConfig,
    /// SSE keep-alive comment interval
    pub keep_alive: Duration,
    pub wait_ready_default: Duration,
    /// Upper bound for `GET /wait-ready?timeout=`
    pub wait_ready_max: Duration,
}

/// Build the controller's router
pub fn router(state: ApiState, cors: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/gpus", get(gpus))
        .route("/metrics", get(metrics))
        .route("/peak-metrics", get(peak_metrics))
        .route("/lifetime-metrics", get(lifetime_metrics))
        .route("/recipes", get(recipes))
        .route("/launch", get(current_launch))
        .route("/launch/:recipe_id", post(launch))
        .route("/launch/:recipe_id/cancel", post(cancel_launch))
        .route("/evict", post(evict))
        .route("/wait-ready", get(wait_ready))
        .route("/events", get(sse::events))
        .route("/events/stats", get(event_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Error body `{error, category}` with the status from the error's kind
#[derive(Debug)]
pub struct ApiError(modelhost_core::Error);

impl<E> From<E> for ApiError
where
    E: Into<modelhost_core::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!("Request failed with {}: {}", status, self.0);
        (
            status,
            Json(json!({
                "error": self.0.to_string(),
                "category": self.0.category(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<ApiState>) -> Json<StatusSnapshot> {
    Json(StatusSnapshot::from_process(state.supervisor.current()))
}

async fn gpus(State(state): State<ApiState>) -> impl IntoResponse {
    let gpus = match state.bus.snapshot(EventCategory::Gpu).map(|e| e.payload) {
        Some(EventPayload::Gpu(gpus)) => gpus,
        _ => Vec::new(),
    };
    Json(gpus)
}

/// Latest engine metrics; `null` when no engine is running
async fn metrics(State(state): State<ApiState>) -> Json<Option<MetricsSnapshot>> {
    if state.supervisor.current().is_none() {
        return Json(None);
    }
    match state.bus.snapshot(EventCategory::Metrics).map(|e| e.payload) {
        Some(EventPayload::Metrics(snapshot)) => Json(Some(snapshot)),
        _ => Json(None),
    }
}

async fn peak_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.aggregator.peak())
}

async fn lifetime_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.aggregator.lifetime())
}

async fn recipes(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.recipes.list().await?))
}

async fn current_launch(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.current())
}

async fn launch(
    State(state): State<ApiState>,
    Path(recipe_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .orchestrator
        .request_launch(&RecipeId::new(recipe_id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(session)))
}

async fn cancel_launch(
    State(state): State<ApiState>,
    Path(recipe_id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state
        .orchestrator
        .cancel_launch(Some(&RecipeId::new(recipe_id)));
    Json(json!({ "cancelled": cancelled }))
}

async fn evict(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let evicted = state.orchestrator.evict().await?;
    Ok(Json(json!({ "evicted": evicted })))
}

#[derive(Debug, Deserialize)]
struct WaitReadyQuery {
    /// Seconds
    timeout: Option<u64>,
}

/// Body of `GET /wait-ready`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitReadyResponse {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

async fn wait_ready(
    State(state): State<ApiState>,
    Query(query): Query<WaitReadyQuery>,
) -> Json<WaitReadyResponse> {
    let timeout = query
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(state.wait_ready_default)
        .min(state.wait_ready_max);

    let Some(process) = state.supervisor.current() else {
        return Json(WaitReadyResponse {
            ready: false,
            reason: Some("no engine running".to_string()),
        });
    };

    let target = ProbeTarget {
        port: process.port,
        health_path: state.backends.get(process.backend).health_path.clone(),
        timeout,
    };
    let supervisor = state.supervisor.clone();
    let pid = process.pid;
    let alive = move || supervisor.is_alive(pid);
    // Dropping the request drops the probe; nothing else to cancel
    let outcome = state
        .prober
        .wait_ready(&target, &alive, &CancellationToken::new())
        .await;

    let reason = match outcome {
        ReadinessOutcome::Ready => None,
        ReadinessOutcome::Timeout => Some(format!(
            "engine not healthy within {}s",
            timeout.as_secs()
        )),
        ReadinessOutcome::Crashed => Some("engine process exited".to_string()),
        ReadinessOutcome::Cancelled => Some("cancelled".to_string()),
    };
    Json(WaitReadyResponse {
        ready: outcome == ReadinessOutcome::Ready,
        reason,
    })
}

async fn event_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.bus.stats())
}
