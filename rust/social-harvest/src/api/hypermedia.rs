//! Hypermedia response envelope.
//!
//! Every JSON route answers with the same shape:
//!
//! ```json
//! {
//!   "_links": { "self": { "href": "/schedule/read" } },
//!   "_curies": [{ "name": "schedule", "href": "/docs/rels/{rel}", "templated": true }],
//!   "data": { ... },
//!   "success": true,
//!   "message": "There are 3 jobs scheduled.",
//!   "meta": { "responded": "2024-01-01T00:00:00Z", "response_time_ms": 0.4 }
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Instant;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// A link relation target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HypermediaLink {
    pub href: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub templated: bool,
}

/// Compact URI prefix for namespaced link relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HypermediaCurie {
    pub name: String,
    pub href: String,
    pub templated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HypermediaMeta {
    pub responded: DateTime<Utc>,
    pub response_time_ms: f64,
}

/// Response under construction.
#[derive(Debug)]
pub struct HypermediaResource {
    links: BTreeMap<String, HypermediaLink>,
    curies: Vec<HypermediaCurie>,
    data: Map<String, Value>,
    success: bool,
    status: StatusCode,
    started: Instant,
}

/// Serialized form of a finished resource.
#[derive(Debug, Serialize)]
pub struct HypermediaBody {
    #[serde(rename = "_links")]
    pub links: BTreeMap<String, HypermediaLink>,
    #[serde(rename = "_curies", skip_serializing_if = "Vec::is_empty")]
    pub curies: Vec<HypermediaCurie>,
    pub data: Map<String, Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub meta: HypermediaMeta,
}

impl Default for HypermediaResource {
    fn default() -> Self {
        Self::new()
    }
}

impl HypermediaResource {
    /// Start a resource; the response time is measured from here.
    pub fn new() -> Self {
        Self {
            links: BTreeMap::new(),
            curies: Vec::new(),
            data: Map::new(),
            success: false,
            status: StatusCode::OK,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn link(mut self, rel: &str, href: impl Into<String>) -> Self {
        self.links.insert(
            rel.to_string(),
            HypermediaLink {
                href: href.into(),
                templated: false,
            },
        );
        self
    }

    /// Add an RFC 6570 templated link.
    #[must_use]
    pub fn templated_link(mut self, rel: &str, href: impl Into<String>) -> Self {
        self.links.insert(
            rel.to_string(),
            HypermediaLink {
                href: href.into(),
                templated: true,
            },
        );
        self
    }

    #[must_use]
    pub fn curie(mut self, name: &str, href: impl Into<String>, templated: bool) -> Self {
        self.curies.push(HypermediaCurie {
            name: name.to_string(),
            href: href.into(),
            templated,
        });
        self
    }

    /// Put a value under `data.<key>`.
    #[must_use]
    pub fn data(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "Failed to encode response data");
            Value::Null
        });
        self.data.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn success(mut self) -> Self {
        self.success = true;
        self
    }

    /// Mark the response as failed with an HTTP status.
    #[must_use]
    pub fn failure(mut self, status: StatusCode) -> Self {
        self.success = false;
        self.status = status;
        self
    }

    /// Finish without a message.
    pub fn end(self) -> HypermediaResponse {
        self.finish(None)
    }

    /// Finish with a human readable message.
    pub fn end_with(self, message: impl Into<String>) -> HypermediaResponse {
        self.finish(Some(message.into()))
    }

    fn finish(self, message: Option<String>) -> HypermediaResponse {
        HypermediaResponse {
            status: self.status,
            body: HypermediaBody {
                links: self.links,
                curies: self.curies,
                data: self.data,
                success: self.success,
                message,
                meta: HypermediaMeta {
                    responded: Utc::now(),
                    response_time_ms: self.started.elapsed().as_secs_f64() * 1000.0,
                },
            },
        }
    }
}

/// Finished envelope with its status code.
#[derive(Debug)]
pub struct HypermediaResponse {
    pub status: StatusCode,
    pub body: HypermediaBody,
}

impl IntoResponse for HypermediaResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
