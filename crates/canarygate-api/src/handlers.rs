//! REST API handlers.
//!
//! Reads go straight to the `StateStore`; the one mutation (rollout
//! cancellation) goes through the shared gate handle so it serializes
//! with gate ticks.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::info;

use canarygate_rollout::GateError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Alarms ─────────────────────────────────────────────────────

/// GET /api/v1/alarms
pub async fn list_alarms(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_alarms() {
        Ok(alarms) => ApiResponse::ok(alarms).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/alarms/:id
pub async fn get_alarm(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_alarm(&id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("alarm not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Rollouts ───────────────────────────────────────────────────

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_rollouts() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/rollouts/:id
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_rollout(&id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("rollout not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/rollouts/:id/cancel
pub async fn cancel_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!(rollout = %id, "cancellation requested");
    let result = state.gate.write().await.cancel(&id, epoch_secs()).await;
    match result {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e @ GateError::NotFound(_)) => {
            error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response()
        }
        Err(e @ GateError::Terminal(_)) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Incidents ──────────────────────────────────────────────────

/// GET /api/v1/incidents
pub async fn list_incidents(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_incidents() {
        Ok(incidents) => ApiResponse::ok(incidents).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Probe runs ─────────────────────────────────────────────────

/// Query parameters for the probe run listing.
#[derive(serde::Deserialize)]
pub struct RunsQuery {
    /// Most-recent-first cap; default 20.
    pub limit: Option<usize>,
}

/// GET /api/v1/probes/:name/runs
pub async fn list_probe_runs(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<RunsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(20);
    match state.store.list_probe_runs(&name, limit) {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let alarms = state.store.list_alarms().unwrap_or_default();
    let rollouts = state.store.list_rollouts().unwrap_or_default();

    // Latest run per configured probe.
    let mut latest_runs = Vec::new();
    for name in &state.probe_names {
        if let Ok(runs) = state.store.list_probe_runs(name, 1) {
            latest_runs.extend(runs);
        }
    }

    let body = canarygate_metrics::render_prometheus(&alarms, &rollouts, &latest_runs);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
