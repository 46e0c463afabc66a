//! canarygate-api — REST API for canarygate.
//!
//! Provides axum route handlers for inspecting alarms, rollouts,
//! incidents, and probe runs, and for cancelling an active rollout.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/alarms` | List alarm records |
//! | GET | `/api/v1/alarms/:id` | Alarm record with transition history |
//! | GET | `/api/v1/rollouts` | List rollout records |
//! | GET | `/api/v1/rollouts/:id` | Rollout record |
//! | POST | `/api/v1/rollouts/:id/cancel` | Cancel (roll back) a rollout |
//! | GET | `/api/v1/incidents` | List incidents |
//! | GET | `/api/v1/probes/:name/runs` | Recent runs for one probe |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use canarygate_rollout::SharedGate;
use canarygate_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    /// Gate handle; cancellation takes the same lock as gate ticks.
    pub gate: SharedGate,
    /// Probe names surfaced on `/metrics` (latest run each).
    pub probe_names: Vec<String>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(store: StateStore, gate: SharedGate, probe_names: Vec<String>) -> Router {
    let state = ApiState {
        store,
        gate,
        probe_names,
    };

    let api_routes = Router::new()
        .route("/alarms", get(handlers::list_alarms))
        .route("/alarms/{id}", get(handlers::get_alarm))
        .route("/rollouts", get(handlers::list_rollouts))
        .route("/rollouts/{id}", get(handlers::get_rollout))
        .route("/rollouts/{id}/cancel", post(handlers::cancel_rollout))
        .route("/incidents", get(handlers::list_incidents))
        .route("/probes/{name}/runs", get(handlers::list_probe_runs))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
