use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::models::{DocumentRecord, DocumentStatus, RecordUpdate, StatusTransitionError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document '{0}' already exists")]
    DuplicateId(String),

    #[error("content {content_hash} already ingested as document '{existing_id}'")]
    DuplicateContent {
        content_hash: String,
        existing_id: String,
    },

    #[error("document '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] StatusTransitionError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },
}

/// Per-document row store; the single source of truth for stage pointers and status
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails on a duplicate id or duplicate content hash.
    async fn create(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    /// Apply a partial update and return the resulting record
    async fn update(&self, id: &str, update: RecordUpdate) -> Result<DocumentRecord, StoreError>;

    async fn read(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// All records, newest first
    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    id              TEXT PRIMARY KEY NOT NULL,
    bucket          TEXT NOT NULL,
    original_key    TEXT NOT NULL,
    text_key        TEXT,
    filename        TEXT NOT NULL,
    language        TEXT,
    content_type    TEXT NOT NULL,
    size_bytes      INTEGER NOT NULL,
    etag_original   TEXT,
    etag_text       TEXT,
    status          TEXT NOT NULL,
    error           TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    anonymized_txt  TEXT,
    lab_items       TEXT,
    enriched_key    TEXT,
    lab_cache       TEXT,
    patient_id      TEXT,
    content_hash    TEXT NOT NULL UNIQUE,
    model_provider  TEXT,
    model_name      TEXT,
    uploaded_by     TEXT
);
CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
";

const COLUMNS: &str = "id, bucket, original_key, text_key, filename, language, content_type, \
    size_bytes, etag_original, etag_text, status, error, created_at, updated_at, \
    anonymized_txt, lab_items, enriched_key, lab_cache, patient_id, content_hash, \
    model_provider, model_name, uploaded_by";

/// Row as stored, before text columns are decoded into typed fields
struct RawRow {
    id: String,
    bucket: String,
    original_key: String,
    text_key: Option<String>,
    filename: String,
    language: Option<String>,
    content_type: String,
    size_bytes: i64,
    etag_original: Option<String>,
    etag_text: Option<String>,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    anonymized_txt: Option<String>,
    lab_items: Option<String>,
    enriched_key: Option<String>,
    lab_cache: Option<String>,
    patient_id: Option<String>,
    content_hash: String,
    model_provider: Option<String>,
    model_name: Option<String>,
    uploaded_by: Option<String>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            bucket: row.get(1)?,
            original_key: row.get(2)?,
            text_key: row.get(3)?,
            filename: row.get(4)?,
            language: row.get(5)?,
            content_type: row.get(6)?,
            size_bytes: row.get(7)?,
            etag_original: row.get(8)?,
            etag_text: row.get(9)?,
            status: row.get(10)?,
            error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            anonymized_txt: row.get(14)?,
            lab_items: row.get(15)?,
            enriched_key: row.get(16)?,
            lab_cache: row.get(17)?,
            patient_id: row.get(18)?,
            content_hash: row.get(19)?,
            model_provider: row.get(20)?,
            model_name: row.get(21)?,
            uploaded_by: row.get(22)?,
        })
    }

    fn into_record(self) -> Result<DocumentRecord, StoreError> {
        let id = self.id;
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };

        let status: DocumentStatus = self.status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let created_at = parse_timestamp(&self.created_at).map_err(&corrupt)?;
        let updated_at = parse_timestamp(&self.updated_at).map_err(&corrupt)?;
        let lab_cache = self
            .lab_cache
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("lab_cache: {e}")))?;
        let size_bytes = u64::try_from(self.size_bytes)
            .map_err(|_| corrupt(format!("negative size {}", self.size_bytes)))?;

        Ok(DocumentRecord {
            id: id.clone(),
            bucket: self.bucket,
            original_key: self.original_key,
            filename: self.filename,
            language: self.language,
            content_type: self.content_type,
            size_bytes,
            content_hash: self.content_hash,
            etag_original: self.etag_original,
            etag_text: self.etag_text,
            status,
            error: self.error,
            text_key: self.text_key,
            anonymized_key: self.anonymized_txt,
            json_key: self.lab_items,
            enriched_key: self.enriched_key,
            lab_cache,
            patient_id: self.patient_id,
            model_provider: self.model_provider,
            model_name: self.model_name,
            uploaded_by: self.uploaded_by,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("timestamp '{raw}': {e}"))
}

/// SQLite-backed metadata store.
///
/// A single connection behind a mutex; every operation holds the lock for its
/// whole read-modify-write, so updates to one row never interleave. Queries
/// run on the blocking thread pool.
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Corrupt {
                id: String::new(),
                reason: "metadata connection lock poisoned".to_string(),
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Corrupt {
            id: String::new(),
            reason: format!("metadata task failed: {e}"),
        })?
    }
}

fn select_one(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<DocumentRecord>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM documents WHERE {column} = ?1");
    conn.query_row(&sql, params![value], RawRow::from_row)
        .optional()?
        .map(RawRow::into_record)
        .transpose()
}

fn insert(conn: &Connection, r: &DocumentRecord) -> Result<(), StoreError> {
    let lab_cache = r.lab_cache.as_ref().map(|v| v.to_string());
    conn.execute(
        &format!(
            "INSERT INTO documents ({COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
        ),
        params![
            r.id,
            r.bucket,
            r.original_key,
            r.text_key,
            r.filename,
            r.language,
            r.content_type,
            r.size_bytes as i64,
            r.etag_original,
            r.etag_text,
            r.status.as_str(),
            r.error,
            r.created_at.to_rfc3339(),
            r.updated_at.to_rfc3339(),
            r.anonymized_key,
            r.json_key,
            r.enriched_key,
            lab_cache,
            r.patient_id,
            r.content_hash,
            r.model_provider,
            r.model_name,
            r.uploaded_by,
        ],
    )?;
    Ok(())
}

fn write_mutable(conn: &Connection, r: &DocumentRecord) -> Result<(), StoreError> {
    let lab_cache = r.lab_cache.as_ref().map(|v| v.to_string());
    conn.execute(
        "UPDATE documents SET status = ?2, error = ?3, text_key = ?4, anonymized_txt = ?5, \
         lab_items = ?6, enriched_key = ?7, lab_cache = ?8, etag_original = ?9, \
         etag_text = ?10, updated_at = ?11 WHERE id = ?1",
        params![
            r.id,
            r.status.as_str(),
            r.error,
            r.text_key,
            r.anonymized_key,
            r.json_key,
            r.enriched_key,
            lab_cache,
            r.etag_original,
            r.etag_text,
            r.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            if let Some(existing) = select_one(conn, "content_hash", &record.content_hash)? {
                return Err(StoreError::DuplicateContent {
                    content_hash: record.content_hash.clone(),
                    existing_id: existing.id,
                });
            }
            match insert(conn, &record) {
                Err(StoreError::Database(e)) if is_constraint_violation(&e) => {
                    Err(StoreError::DuplicateId(record.id.clone()))
                }
                other => other,
            }
        })
        .await
    }

    async fn update(&self, id: &str, update: RecordUpdate) -> Result<DocumentRecord, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut record =
                select_one(conn, "id", &id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            record.apply(update)?;
            write_mutable(conn, &record)?;
            Ok(record)
        })
        .await
    }

    async fn read(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| select_one(conn, "id", &id)).await
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let content_hash = content_hash.to_string();
        self.with_conn(move |conn| select_one(conn, "content_hash", &content_hash))
            .await
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM documents ORDER BY created_at DESC"
            ))?;
            let rows = stmt
                .query_map([], RawRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawRow::into_record).collect()
        })
        .await
    }
}

/// In-memory metadata store with the same uniqueness rules as the SQLite one
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<String, DocumentRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, DocumentRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Corrupt {
            id: String::new(),
            reason: "metadata lock poisoned".to_string(),
        })?;
        f(&mut records)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        self.with_records(|records| {
            if let Some(existing) = records
                .values()
                .find(|r| r.content_hash == record.content_hash)
            {
                return Err(StoreError::DuplicateContent {
                    content_hash: record.content_hash.clone(),
                    existing_id: existing.id.clone(),
                });
            }
            if records.contains_key(&record.id) {
                return Err(StoreError::DuplicateId(record.id.clone()));
            }
            records.insert(record.id.clone(), record.clone());
            Ok(())
        })
    }

    async fn update(&self, id: &str, update: RecordUpdate) -> Result<DocumentRecord, StoreError> {
        self.with_records(|records| {
            let record = records
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            record.apply(update)?;
            Ok(record.clone())
        })
    }

    async fn read(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        self.with_records(|records| Ok(records.get(id).cloned()))
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>, StoreError> {
        self.with_records(|records| {
            Ok(records
                .values()
                .find(|r| r.content_hash == content_hash)
                .cloned())
        })
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.with_records(|records| {
            let mut all: Vec<_> = records.values().cloned().collect();
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(all)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, hash: &str) -> DocumentRecord {
        DocumentRecord::new(
            id,
            "report.pdf",
            "application/pdf",
            42,
            hash,
            "bronze",
            format!("documents/{id}/{id}.pdf"),
        )
    }

    #[tokio::test]
    async fn test_sqlite_create_and_read() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        let mut rec = record("a", "h1");
        rec.language = Some("mk".to_string());
        store.create(&rec).await.unwrap();

        let loaded = store.read("a").await.unwrap().unwrap();
        assert_eq!(loaded.filename, "report.pdf");
        assert_eq!(loaded.language.as_deref(), Some("mk"));
        assert_eq!(loaded.status, DocumentStatus::Uploaded);
        assert!(store.read("missing").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_store_shared_across_tasks() {
        let store = Arc::new(SqliteMetadataStore::open_in_memory().unwrap());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                let id = format!("doc-{i}");
                store.create(&record(&id, &format!("h{i}"))).await.unwrap();
                store
                    .update(&id, RecordUpdate::status(DocumentStatus::Processed))
                    .await
                    .unwrap()
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap().status, DocumentStatus::Processed);
        }
        assert_eq!(store.list().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_sqlite_rejects_duplicates() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        store.create(&record("a", "h1")).await.unwrap();

        let err = store.create(&record("b", "h1")).await.unwrap_err();
        match err {
            StoreError::DuplicateContent { existing_id, .. } => assert_eq!(existing_id, "a"),
            other => panic!("unexpected error: {other}"),
        }

        let err = store.create(&record("a", "h2")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_sqlite_update_persists_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.sqlite3");
        {
            let store = SqliteMetadataStore::open(&path).unwrap();
            store.create(&record("a", "h1")).await.unwrap();
            store
                .update(
                    "a",
                    RecordUpdate::status(DocumentStatus::JsonSerialized)
                        .with_json_key("documents/a/a.json")
                        .with_lab_cache(json!({"total_tests": 3})),
                )
                .await
                .unwrap();
        }

        let store = SqliteMetadataStore::open(&path).unwrap();
        let loaded = store.read("a").await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::JsonSerialized);
        assert_eq!(loaded.json_key.as_deref(), Some("documents/a/a.json"));
        assert_eq!(loaded.lab_cache, Some(json!({"total_tests": 3})));
    }

    #[tokio::test]
    async fn test_update_rejects_regression() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        store.create(&record("a", "h1")).await.unwrap();
        store
            .update("a", RecordUpdate::status(DocumentStatus::Anonymized))
            .await
            .unwrap();
        let err = store
            .update("a", RecordUpdate::status(DocumentStatus::Processed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
    }

    #[tokio::test]
    async fn test_memory_store_matches_sqlite_rules() {
        let store = MemoryMetadataStore::new();
        store.create(&record("a", "h1")).await.unwrap();
        assert!(matches!(
            store.create(&record("b", "h1")).await,
            Err(StoreError::DuplicateContent { .. })
        ));
        assert!(matches!(
            store.update("zzz", RecordUpdate::default()).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.find_by_hash("h1").await.unwrap().unwrap().id, "a");
    }
}
