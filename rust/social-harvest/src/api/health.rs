//! Health check endpoints.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;
use crate::domain::{HARVEST_TOPIC, RecordKind};

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
}

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
}

/// Basic health check.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
    })
}

/// Readiness check response.
#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    store: &'static str,
    schedule_entries: usize,
    storage_workers: usize,
    subscribers: usize,
}

/// Ready once the schedule is wired and one storage worker per record kind
/// is running. Stream clients count as subscribers but not as workers.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let context = &state.context;
    let schedule_entries = context.schedule.len();
    let storage_workers = context.storage_workers.running();
    let subscribers = context.bus.subscriber_count(HARVEST_TOPIC);
    let ready = schedule_entries > 0 && storage_workers == RecordKind::ALL.len();

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "starting" },
            store: context.store.backend(),
            schedule_entries,
            storage_workers,
            subscribers,
        }),
    )
}
