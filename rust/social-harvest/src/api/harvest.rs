//! Harvest configuration and territory data endpoints.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use super::hypermedia::{HypermediaResource, HypermediaResponse};
use crate::AppState;
use crate::domain::RecordKind;
use crate::storage::FieldQuery;

const AGGREGATE_TEMPLATE: &str = "/territory/aggregate/{territory}/{collection}{?from,to,fields}";

/// Create the harvest router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config/read", get(read_config))
        .route("/territory/list", get(list_territories))
        .route(
            "/territory/aggregate/{territory}/{collection}",
            get(aggregate_territory),
        )
}

/// Harvest section of the running configuration.
async fn read_config(State(state): State<AppState>) -> HypermediaResponse {
    HypermediaResource::new()
        .link("self", "/config/read")
        .data("config", &state.context.config.harvest)
        .success()
        .end()
}

/// Every configured territory with its schedule and content settings.
async fn list_territories(State(state): State<AppState>) -> HypermediaResponse {
    HypermediaResource::new()
        .curie("territory", "/docs/rels/{rel}", true)
        .link("self", "/territory/list")
        .templated_link("territory:aggregate-data", AGGREGATE_TEMPLATE)
        .data("territories", &state.context.config.harvest.territories)
        .success()
        .end()
}

#[derive(Debug, Default, Deserialize)]
struct AggregateQuery {
    from: Option<String>,
    to: Option<String>,
    fields: Option<String>,
    limit: Option<String>,
}

/// Value counts for fields of one collection within one territory.
async fn aggregate_territory(
    State(state): State<AppState>,
    Path((territory, collection)): Path<(String, String)>,
    Query(query): Query<AggregateQuery>,
) -> HypermediaResponse {
    let resource = HypermediaResource::new()
        .link("self", format!("/territory/aggregate/{territory}/{collection}"))
        .link("territory:list", "/territory/list");

    let fields = split_fields(query.fields.as_deref().unwrap_or_default());
    if territory.trim().is_empty() || fields.is_empty() {
        return resource.end_with("territory, collection and fields are required");
    }
    if RecordKind::from_collection(&collection).is_none() {
        return resource
            .failure(StatusCode::NOT_FOUND)
            .end_with(format!("Unknown collection '{collection}'"));
    }

    let mut field_query = FieldQuery::new(&collection, &territory);
    field_query.limit = query.limit.as_deref().and_then(|l| l.trim().parse().ok());
    for (bound, raw, slot) in [
        ("from", query.from.as_deref(), &mut field_query.from),
        ("to", query.to.as_deref(), &mut field_query.to),
    ] {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => {}
            Some(raw) => match parse_bound(raw) {
                Some(time) => *slot = Some(time),
                None => {
                    return resource
                        .failure(StatusCode::BAD_REQUEST)
                        .end_with(format!("Invalid '{bound}' time: {raw}"));
                }
            },
        }
    }

    match state.context.store.field_counts(&field_query, &fields).await {
        Ok(counts) => resource
            .data("aggregate", &counts.fields)
            .data("total", counts.documents)
            .success()
            .end(),
        Err(e) => {
            tracing::error!(
                territory = %territory,
                collection = %collection,
                error = %e,
                "Aggregate query failed"
            );
            resource
                .failure(StatusCode::INTERNAL_SERVER_ERROR)
                .end_with("Aggregate query failed")
        }
    }
}

fn split_fields(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// RFC 3339 timestamp, or a bare `YYYY-MM-DD` date at midnight UTC.
fn parse_bound(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
