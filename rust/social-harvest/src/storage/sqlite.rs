//! `SQLite` document store.
//!
//! Each record is one row in the `documents` table, its body kept as JSON
//! text. Columns derived at insert time keep the body out of the hot paths:
//!
//! | Column | Source | Used by |
//! |--------|--------|---------|
//! | `collection`, `territory` | copied from the record | every query |
//! | `time_ms` | `time` as Unix milliseconds | aggregate time bounds |
//! | `is_empty` | [`is_empty_document`] | empty-document sweep |
//!
//! Databases created before the derived columns existed are upgraded on open
//! and their rows backfilled from the stored bodies.
//!
//! # Example
//!
//! ```rust,ignore
//! use social_harvest::storage::SqliteStore;
//!
//! let store = SqliteStore::new("./data/harvest.db").await?;
//! store.persist(RecordKind::Message, &event).await?;
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::{Connection, params};
use serde_json::Value;
use tokio::task;

use super::{FieldCounts, FieldQuery, Persistence, StorageError, document_for, is_empty_document};
use crate::domain::{HarvestEvent, RecordKind};

/// SQLite-backed [`Persistence`].
///
/// # Thread Safety
///
/// Each operation opens its own connection on the blocking thread pool; WAL
/// mode lets the dispatcher workers write while the API reads.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn new<P: Into<PathBuf>>(path: P) -> Result<Self, StorageError> {
        let store = Self {
            db_path: path.into(),
        };
        store.migrate_schema().await?;
        Ok(store)
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn migrate_schema(&self) -> Result<(), StorageError> {
        self.with_connection(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    collection TEXT NOT NULL,
                    territory TEXT,
                    time TEXT,
                    time_ms INTEGER,
                    is_empty INTEGER NOT NULL DEFAULT 0,
                    body TEXT NOT NULL
                );
                ",
            )?;

            let mut added = false;
            for (column, definition) in DERIVED_COLUMNS {
                if !has_column(conn, column)? {
                    conn.execute_batch(&format!(
                        "ALTER TABLE documents ADD COLUMN {column} {definition}"
                    ))?;
                    added = true;
                }
            }
            if added {
                let rows = backfill_derived_columns(conn)?;
                tracing::info!(rows, "Backfilled derived document columns");
            }

            conn.execute_batch(
                r"
                CREATE INDEX IF NOT EXISTS idx_documents_collection_territory
                    ON documents(collection, territory);
                CREATE INDEX IF NOT EXISTS idx_documents_collection_empty
                    ON documents(collection, is_empty);
                ",
            )?;
            Ok(())
        })
        .await
    }

    /// Append a document as-is, bypassing record encoding.
    pub async fn insert_raw(&self, collection: &str, document: Value) -> Result<(), StorageError> {
        let collection = collection.to_string();
        self.with_connection(move |conn| insert(conn, &collection, &document))
            .await
    }

    /// Number of rows in `collection`.
    pub async fn count(&self, collection: &str) -> Result<u64, StorageError> {
        let collection = collection.to_string();
        self.with_connection(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )?;
            Ok(count.try_into().unwrap_or_default())
        })
        .await
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            op(&mut conn)
        })
        .await?
    }
}

/// Columns added after the first schema, with their definitions.
const DERIVED_COLUMNS: [(&str, &str); 2] = [
    ("time_ms", "INTEGER"),
    ("is_empty", "INTEGER NOT NULL DEFAULT 0"),
];

fn has_column(conn: &Connection, column: &str) -> Result<bool, StorageError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('documents')")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn backfill_derived_columns(conn: &mut Connection) -> Result<usize, StorageError> {
    let tx = conn.transaction()?;
    let rows: Vec<(i64, String)> = {
        let mut stmt = tx.prepare("SELECT id, body FROM documents")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };
    {
        let mut update =
            tx.prepare("UPDATE documents SET time_ms = ?2, is_empty = ?3 WHERE id = ?1")?;
        for (id, body) in &rows {
            // Unreadable bodies count as missing documents.
            let document = serde_json::from_str(body).unwrap_or(Value::Null);
            update.execute(params![
                id,
                time_millis(&document),
                is_empty_document(&document)
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

/// The document's `time` as Unix milliseconds, when it is RFC 3339.
fn time_millis(document: &Value) -> Option<i64> {
    let time = document.get("time")?.as_str()?;
    DateTime::parse_from_rfc3339(time)
        .ok()
        .map(|t| t.timestamp_millis())
}

fn insert(conn: &Connection, collection: &str, document: &Value) -> Result<(), StorageError> {
    let territory = document.get("territory").and_then(Value::as_str);
    let time = document.get("time").and_then(Value::as_str);
    let body = serde_json::to_string(document)?;
    conn.execute(
        "INSERT INTO documents (collection, territory, time, time_ms, is_empty, body) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            collection,
            territory,
            time,
            time_millis(document),
            is_empty_document(document),
            body
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Persistence for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn persist(&self, kind: RecordKind, event: &HarvestEvent) -> Result<(), StorageError> {
        let document = document_for(kind, event)?;
        self.with_connection(move |conn| {
            insert(conn, kind.collection(), &document).map_err(|e| {
                StorageError::PersistenceFailure {
                    collection: kind.collection().to_string(),
                    reason: e.to_string(),
                }
            })
        })
        .await
    }

    async fn remove_empty_documents(&self, collection: &str) -> Result<u64, StorageError> {
        let collection = collection.to_string();
        self.with_connection(move |conn| {
            let removed = conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND is_empty = 1",
                params![collection],
            )?;
            Ok(removed as u64)
        })
        .await
    }

    async fn field_counts(
        &self,
        query: &FieldQuery,
        fields: &[String],
    ) -> Result<FieldCounts, StorageError> {
        let query = query.clone();
        let fields = fields.to_vec();
        self.with_connection(move |conn| {
            // Millisecond bounds may admit a few extra rows at the edges;
            // the tally applies the exact range.
            let mut stmt = conn.prepare(
                "SELECT body FROM documents \
                 WHERE collection = ?1 AND territory = ?2 \
                 AND (?3 IS NULL OR time_ms >= ?3) \
                 AND (?4 IS NULL OR time_ms <= ?4) \
                 ORDER BY id",
            )?;
            let from = query.from.map(|t| t.timestamp_millis());
            let to = query.to.map(|t| t.timestamp_millis());
            let rows = stmt.query_map(
                params![query.collection, query.territory, from, to],
                |row| row.get::<_, String>(0),
            )?;
            let mut documents = Vec::new();
            for body in rows {
                documents.push(serde_json::from_str::<Value>(&body?)?);
            }
            Ok(FieldCounts::tally(&documents, &query, &fields))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HarvestHashtag, HarvestMention, HarvestMessage};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("harvest.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_persist_and_count() {
        let (store, _dir) = create_test_store().await;
        let event = HarvestEvent::Mention(HarvestMention {
            territory: "north".to_string(),
            mentioned_screen_name: "rustlang".to_string(),
            ..Default::default()
        });

        store.persist(RecordKind::Mention, &event).await.unwrap();
        store.persist(RecordKind::Mention, &event).await.unwrap();

        assert_eq!(store.count("mentions").await.unwrap(), 2);
        assert_eq!(store.count("messages").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persist_wrong_kind_fails() {
        let (store, _dir) = create_test_store().await;
        let event = HarvestEvent::Mention(HarvestMention::default());
        let err = store.persist(RecordKind::Hashtag, &event).await.unwrap_err();
        assert!(matches!(err, StorageError::PersistenceFailure { .. }));
    }

    #[tokio::test]
    async fn test_remove_empty_documents() {
        let (store, _dir) = create_test_store().await;
        store.insert_raw("messages", Value::Null).await.unwrap();
        store
            .insert_raw("messages", json!({ "message": "", "network": null }))
            .await
            .unwrap();
        store.insert_raw("mentions", json!({})).await.unwrap();
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage {
                    message: "kept".to_string(),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        assert_eq!(store.remove_empty_documents("messages").await.unwrap(), 2);
        assert_eq!(store.count("messages").await.unwrap(), 1);
        // Other collections are untouched.
        assert_eq!(store.count("mentions").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_default_records_are_swept() {
        let (store, _dir) = create_test_store().await;
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage::default()),
            )
            .await
            .unwrap();
        store
            .persist(
                RecordKind::Hashtag,
                &HarvestEvent::Hashtag(HarvestHashtag::default()),
            )
            .await
            .unwrap();
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage {
                    like_count: 4,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        assert_eq!(store.remove_empty_documents("messages").await.unwrap(), 1);
        assert_eq!(store.remove_empty_documents("hashtags").await.unwrap(), 1);
        assert_eq!(store.count("messages").await.unwrap(), 1);
        assert_eq!(store.remove_empty_documents("messages").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_field_counts_time_bounds() {
        let (store, _dir) = create_test_store().await;
        for time in [
            "2024-03-01T10:00:00Z",
            "2024-03-02T10:00:00.000400Z",
            "2024-03-02T10:00:00.000600Z",
            "2024-03-02T11:00:00Z",
            "2024-03-03T10:00:00Z",
        ] {
            store
                .insert_raw(
                    "messages",
                    json!({ "territory": "north", "network": "twitter", "time": time }),
                )
                .await
                .unwrap();
        }

        let mut query = FieldQuery::new("messages", "north");
        query.from = Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        query.to = Some(Utc.with_ymd_and_hms(2024, 3, 3, 10, 0, 0).unwrap());
        let counts = store
            .field_counts(&query, &["network".to_string()])
            .await
            .unwrap();
        assert_eq!(counts.documents, 3);

        // Both records share a millisecond with the bound; only the earlier
        // one is inside it.
        query.to = Some(
            Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap()
                + chrono::Duration::microseconds(500),
        );
        let counts = store
            .field_counts(&query, &["network".to_string()])
            .await
            .unwrap();
        assert_eq!(counts.documents, 1);
    }

    #[tokio::test]
    async fn test_open_upgrades_older_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("harvest.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    collection TEXT NOT NULL,
                    territory TEXT,
                    time TEXT,
                    body TEXT NOT NULL
                );
                INSERT INTO documents (collection, territory, time, body) VALUES
                    ('messages', '', '1970-01-01T00:00:00Z',
                     '{"territory":"","time":"1970-01-01T00:00:00Z","like_count":0}'),
                    ('messages', 'north', '2024-03-02T10:00:00Z',
                     '{"territory":"north","time":"2024-03-02T10:00:00Z","network":"twitter"}'),
                    ('messages', NULL, NULL, 'not json');
                "#,
            )
            .unwrap();
        }

        let store = SqliteStore::new(&path).await.unwrap();
        assert_eq!(store.remove_empty_documents("messages").await.unwrap(), 2);

        let mut query = FieldQuery::new("messages", "north");
        query.from = Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        let counts = store
            .field_counts(&query, &["network".to_string()])
            .await
            .unwrap();
        assert_eq!(counts.documents, 1);
    }

    #[tokio::test]
    async fn test_field_counts() {
        let (store, _dir) = create_test_store().await;
        for (territory, network) in [("north", "twitter"), ("north", "twitter"), ("south", "facebook")] {
            store
                .insert_raw("messages", json!({ "territory": territory, "network": network }))
                .await
                .unwrap();
        }

        let counts = store
            .field_counts(&FieldQuery::new("messages", "north"), &["network".to_string()])
            .await
            .unwrap();

        assert_eq!(counts.documents, 2);
        assert_eq!(counts.fields["network"]["twitter"], 2);
        assert!(!counts.fields["network"].contains_key("facebook"));
    }

    #[tokio::test]
    async fn test_reopen_keeps_documents() {
        let (store, dir) = create_test_store().await;
        store.insert_raw("hashtags", json!({ "tag": "a" })).await.unwrap();

        let reopened = SqliteStore::new(dir.path().join("harvest.db")).await.unwrap();
        assert_eq!(reopened.count("hashtags").await.unwrap(), 1);
    }
}
