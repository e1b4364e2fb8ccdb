//! Live NDJSON record streams.

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use super::hypermedia::HypermediaResource;
use crate::AppState;
use crate::stream::{StreamBridge, StreamFilter};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Create the stream router.
///
/// Kept apart from the other routes so the request timeout never applies.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stream", get(stream_all))
        .route("/stream/{network}", get(stream_network))
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    /// Comma separated record kinds.
    kinds: Option<String>,
    territory: Option<String>,
}

async fn stream_all(State(state): State<AppState>, Query(query): Query<StreamQuery>) -> Response {
    open_stream(&state, query, None)
}

async fn stream_network(
    State(state): State<AppState>,
    Path(network): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    open_stream(&state, query, Some(network))
}

fn open_stream(state: &AppState, query: StreamQuery, network: Option<String>) -> Response {
    let kinds = match StreamFilter::parse_kinds(query.kinds.as_deref().unwrap_or_default()) {
        Ok(kinds) => kinds,
        Err(e) => {
            return HypermediaResource::new()
                .link("self", "/stream")
                .failure(StatusCode::BAD_REQUEST)
                .end_with(e)
                .into_response();
        }
    };
    let filter = StreamFilter {
        kinds,
        territory: query.territory.filter(|t| !t.trim().is_empty()),
        network,
    };

    let context = &state.context;
    let bridge = StreamBridge::new(
        &context.bus,
        filter,
        context.config.stream.pace(),
        state.shutdown.child_token(),
    );

    (
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(bridge.into_body_stream()),
    )
        .into_response()
}
