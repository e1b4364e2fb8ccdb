//! Durable storage of harvested records.
//!
//! The [`Persistence`] trait is the seam between the dispatcher workers and
//! the storage engine. Two backends are provided:
//!
//! - [`MemoryStore`]: in-process collections, the default and the test double
//! - [`SqliteStore`]: one JSON document per row in a `SQLite` file
//!
//! Documents are the record bodies produced by
//! [`HarvestEvent::to_document`], grouped into one collection per
//! [`RecordKind`].

pub mod dispatcher;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{HarvestEvent, RecordKind};

pub use dispatcher::{
    DEFAULT_WORKER_BUFFER, DispatcherOptions, EmptyDocumentCleanup, StorageDispatcher,
    WorkerGauge, WorkerStats,
};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A record could not be written.
    #[error("Failed to persist into '{collection}': {reason}")]
    PersistenceFailure {
        /// Target collection.
        collection: String,
        /// What went wrong.
        reason: String,
    },

    /// A record could not be encoded or a stored document decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage engine itself failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Backend(format!("storage task failed: {err}"))
    }
}

/// Selection for [`Persistence::field_counts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldQuery {
    /// Collection to read.
    pub collection: String,
    /// Only documents harvested for this territory.
    pub territory: String,
    /// Inclusive lower bound on the document `time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the document `time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    /// Keep only the N most frequent values per field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl FieldQuery {
    /// Query every document of `territory` in `collection`.
    pub fn new(collection: impl Into<String>, territory: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            territory: territory.into(),
            from: None,
            to: None,
            limit: None,
        }
    }

    /// Whether a stored document falls inside the query.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        if document.get("territory").and_then(Value::as_str) != Some(self.territory.as_str()) {
            return false;
        }
        if self.from.is_none() && self.to.is_none() {
            return true;
        }
        let Some(time) = document
            .get("time")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            return false;
        };
        self.from.is_none_or(|from| time >= from) && self.to.is_none_or(|to| time < to)
    }
}

/// Value frequencies for a set of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCounts {
    /// Documents that matched the query.
    pub documents: u64,
    /// field → value → occurrences.
    pub fields: BTreeMap<String, BTreeMap<String, u64>>,
}

impl FieldCounts {
    /// Count `fields` over the documents matching `query`.
    ///
    /// Array values count once per element; null and empty values are
    /// skipped.
    pub fn tally<'a, I>(documents: I, query: &FieldQuery, fields: &[String]) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut counts = Self {
            documents: 0,
            fields: fields
                .iter()
                .map(|field| (field.clone(), BTreeMap::new()))
                .collect(),
        };

        for document in documents.into_iter().filter(|doc| query.matches(doc)) {
            counts.documents += 1;
            for (field, values) in &mut counts.fields {
                let Some(value) = document.get(field) else {
                    continue;
                };
                let items = match value {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for key in items.into_iter().filter_map(count_key) {
                    *values.entry(key).or_default() += 1;
                }
            }
        }

        if let Some(limit) = query.limit {
            for values in counts.fields.values_mut() {
                truncate_to_top(values, limit);
            }
        }
        counts
    }
}

fn count_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn truncate_to_top(values: &mut BTreeMap<String, u64>, limit: usize) {
    if values.len() <= limit {
        return;
    }
    let mut ranked: Vec<(String, u64)> = std::mem::take(values).into_iter().collect();
    // Highest count first, ties by value name.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    values.extend(ranked);
}

/// Whether a stored document is empty.
///
/// A document is empty when it is `null`, or an object whose every value is
/// blank: null, `""`, `false`, zero, an empty array or object, or a `time`
/// at the Unix epoch. A record encoded from its default value is therefore
/// empty, while any harvested content (an id, a territory, a count) keeps
/// it.
#[must_use]
pub fn is_empty_document(document: &Value) -> bool {
    match document {
        Value::Null => true,
        Value::Object(map) => map.iter().all(|(key, value)| is_blank(key, value)),
        _ => false,
    }
}

fn is_blank(key: &str, value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n.abs() < f64::EPSILON),
        Value::String(s) if key == "time" => s.is_empty() || is_epoch(s),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn is_epoch(time: &str) -> bool {
    DateTime::parse_from_rfc3339(time)
        .is_ok_and(|t| t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0)
}

/// Persistence collaborator used by the dispatcher and the aggregate route.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Store one record in the collection of `kind`.
    async fn persist(&self, kind: RecordKind, event: &HarvestEvent) -> Result<(), StorageError>;

    /// Delete every empty document in `collection`, returning how many were
    /// removed.
    async fn remove_empty_documents(&self, collection: &str) -> Result<u64, StorageError>;

    /// Count the values of `fields` over the documents selected by `query`.
    async fn field_counts(
        &self,
        query: &FieldQuery,
        fields: &[String],
    ) -> Result<FieldCounts, StorageError>;
}

/// Encode `event` for the collection of `kind`.
pub(crate) fn document_for(kind: RecordKind, event: &HarvestEvent) -> Result<Value, StorageError> {
    if event.kind() != kind {
        return Err(StorageError::PersistenceFailure {
            collection: kind.collection().to_string(),
            reason: format!("record of kind '{}' does not belong here", event.kind()),
        });
    }
    Ok(event.to_document()?)
}
