//! Schedule introspection endpoints.

use axum::{
    Router,
    extract::{Query, State},
    routing::get,
};
use serde::Deserialize;

use super::hypermedia::{HypermediaResource, HypermediaResponse};
use crate::AppState;
use crate::orchestrator::schedule_view;

const DEFAULT_RUNS_LIMIT: usize = 20;

/// Create the schedule router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/schedule/read", get(show_schedule))
        .route("/schedule/runs", get(list_runs))
}

/// Every scheduled job, ordered by next run.
async fn show_schedule(State(state): State<AppState>) -> HypermediaResponse {
    let jobs = schedule_view(&state.context.schedule);
    let total = jobs.len();

    HypermediaResource::new()
        .curie("schedule", "/docs/rels/{rel}", true)
        .link("self", "/schedule/read")
        .templated_link("schedule:runs", "/schedule/runs{?limit}")
        .data("totalJobs", total)
        .data("jobs", jobs)
        .success()
        .end_with(format!("There are {total} jobs scheduled."))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

/// Recent job runs, newest first.
async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> HypermediaResponse {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    let runs = state.context.schedule.runs(limit);

    HypermediaResource::new()
        .link("self", "/schedule/runs")
        .link("schedule:read", "/schedule/read")
        .data("total", runs.len())
        .data("runs", runs)
        .success()
        .end()
}
