//! HTTP API endpoints.

pub mod harvest;
pub mod health;
pub mod hypermedia;
pub mod schedule;
pub mod stream;

use axum::Router;

use crate::AppState;

/// Create the request/response API router.
///
/// Streaming routes live in [`stream::router`].
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(schedule::router())
        .merge(harvest::router())
}
