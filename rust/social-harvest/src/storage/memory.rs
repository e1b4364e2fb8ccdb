//! In-memory document store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{FieldCounts, FieldQuery, Persistence, StorageError, document_for, is_empty_document};
use crate::domain::{HarvestEvent, RecordKind};

/// Collections of JSON documents kept in process memory.
///
/// Cloning shares the same collections.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<HashMap<String, Vec<Value>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a document as-is, bypassing record encoding.
    pub fn insert_raw(&self, collection: &str, document: Value) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(document);
    }

    /// Snapshot of the documents in `collection`.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in `collection`.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.collections.read().get(collection).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn persist(&self, kind: RecordKind, event: &HarvestEvent) -> Result<(), StorageError> {
        let document = document_for(kind, event)?;
        self.insert_raw(kind.collection(), document);
        Ok(())
    }

    async fn remove_empty_documents(&self, collection: &str) -> Result<u64, StorageError> {
        let mut collections = self.collections.write();
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = documents.len();
        documents.retain(|doc| !is_empty_document(doc));
        Ok((before - documents.len()) as u64)
    }

    async fn field_counts(
        &self,
        query: &FieldQuery,
        fields: &[String],
    ) -> Result<FieldCounts, StorageError> {
        let collections = self.collections.read();
        let documents = collections
            .get(&query.collection)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(FieldCounts::tally(documents, query, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HarvestHashtag, HarvestMessage};
    use serde_json::json;

    #[tokio::test]
    async fn test_persist_into_kind_collection() {
        let store = MemoryStore::new();
        let event = HarvestEvent::Hashtag(HarvestHashtag {
            territory: "north".to_string(),
            tag: "rust".to_string(),
            ..Default::default()
        });

        store.persist(RecordKind::Hashtag, &event).await.unwrap();

        assert_eq!(store.count("hashtags"), 1);
        assert_eq!(store.documents("hashtags")[0]["tag"], "rust");
        assert_eq!(store.count("messages"), 0);
    }

    #[tokio::test]
    async fn test_remove_empty_documents_keeps_real_ones() {
        let store = MemoryStore::new();
        store.insert_raw("messages", Value::Null);
        store.insert_raw("messages", json!({ "message": "" }));
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage {
                    message: "hello".to_string(),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        assert_eq!(store.remove_empty_documents("messages").await.unwrap(), 2);
        assert_eq!(store.count("messages"), 1);
        assert_eq!(store.remove_empty_documents("messages").await.unwrap(), 0);
        assert_eq!(store.remove_empty_documents("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_default_record_is_swept() {
        let store = MemoryStore::new();
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage::default()),
            )
            .await
            .unwrap();
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage {
                    is_question: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        assert_eq!(store.remove_empty_documents("messages").await.unwrap(), 1);
        assert_eq!(store.documents("messages")[0]["is_question"], true);
    }

    #[tokio::test]
    async fn test_field_counts_on_missing_collection() {
        let store = MemoryStore::new();
        let counts = store
            .field_counts(&FieldQuery::new("mentions", "north"), &["network".to_string()])
            .await
            .unwrap();
        assert_eq!(counts.documents, 0);
        assert!(counts.fields["network"].is_empty());
    }
}
