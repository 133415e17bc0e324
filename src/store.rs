//! # SQLite State Store
//!
//! The durable record store behind the delivery loop: processed operations,
//! retry state, dead letters, and projections. The schema is small, but two
//! properties are load-bearing:
//!
//! - The **unique indexes** on `processed_events(stream_message_id)` and
//!   `processed_events(idempotency_key)` are the only cross-instance
//!   synchronization primitive the pipeline has. A second delivery of the
//!   same logical operation - even from another consumer instance - is
//!   rejected here, at the store, not by any lock.
//! - The retry upsert is a **single conditional write** keyed by
//!   `stream_message_id`, so repeated failures converge to one row no matter
//!   how they interleave.
//!
//! ## Async over a Blocking Connection
//!
//! `rusqlite::Connection` is synchronous and `!Sync`, so the store keeps it
//! behind an async mutex and hops onto the blocking thread pool for every
//! operation (`spawn_blocking` + `blocking_lock`). Store calls are tiny
//! single-row statements; a dedicated writer thread would be overkill here.
//!
//! ## Table Overview
//!
//! ```text
//! processed_events                 retry_events
//! ┌──────────────────────┐         ┌───────────────────────┐
//! │ stream_message_id  U │         │ stream_message_id  PK │
//! │ idempotency_key    U │         │ idempotency_key       │
//! │ event_type           │         │ retry_count           │
//! │ status               │         │ last_error            │
//! │ processed_at_ms      │         │ next_retry_at_ms      │
//! └──────────────────────┘         │ status                │
//!                                  └───────────────────────┘
//! dead_letter_events               event_projections
//! ┌──────────────────────┐         ┌───────────────────────┐
//! │ id                PK │         │ id                 PK │
//! │ event_type           │         │ event_type            │
//! │ source_message_id    │         │ source_message_id     │
//! │ payload              │         │ payload               │
//! │ created_at_ms        │         │ created_at_ms         │
//! └──────────────────────┘         └───────────────────────┘
//! ```

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{
    DeadLetterRecord, MessageId, ProcessedRecord, ProcessedStatus, ProjectionRecord, RetryRecord,
    RetryStatus,
};

// =============================================================================
// Schema
// =============================================================================

/// Current schema version; opening a store with a different version fails.
const SCHEMA_VERSION: i64 = 1;

const CREATE_PROCESSED_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS processed_events (
    stream_message_id INTEGER NOT NULL,
    idempotency_key   TEXT NOT NULL,
    event_type        TEXT NOT NULL,
    status            TEXT NOT NULL,
    processed_at_ms   INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS processed_by_message
    ON processed_events(stream_message_id);
CREATE UNIQUE INDEX IF NOT EXISTS processed_by_key
    ON processed_events(idempotency_key);
"#;

const CREATE_RETRY_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS retry_events (
    stream_message_id INTEGER PRIMARY KEY,
    idempotency_key   TEXT NOT NULL,
    retry_count       INTEGER NOT NULL,
    last_error        TEXT NOT NULL,
    next_retry_at_ms  INTEGER NOT NULL,
    status            TEXT NOT NULL
);
"#;

const CREATE_DEAD_LETTER_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS dead_letter_events (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type        TEXT NOT NULL,
    source_message_id INTEGER NOT NULL,
    payload           TEXT NOT NULL,
    created_at_ms     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS dead_letter_by_source
    ON dead_letter_events(source_message_id);
"#;

const CREATE_EVENT_PROJECTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS event_projections (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type        TEXT NOT NULL,
    source_message_id INTEGER NOT NULL,
    payload           TEXT NOT NULL,
    created_at_ms     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS projections_by_source
    ON event_projections(source_message_id);
"#;

const CREATE_META: &str = r#"
CREATE TABLE IF NOT EXISTS conveyor_meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "BEGIN;\n{CREATE_PROCESSED_EVENTS}\n{CREATE_RETRY_EVENTS}\n{CREATE_DEAD_LETTER_EVENTS}\n{CREATE_EVENT_PROJECTIONS}\n{CREATE_META}\nCOMMIT;"
    ))?;

    let version: Option<i64> = conn
        .query_row(
            "SELECT value FROM conveyor_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO conveyor_meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(v) => Err(Error::Schema(format!(
            "unsupported schema version {v} (expected {SCHEMA_VERSION})"
        ))),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

// =============================================================================
// StateStore
// =============================================================================

/// Async handle to the pipeline's SQLite-backed record store.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Opens or creates a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a fresh in-memory store (tests, embedded soak runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }

    // =========================================================================
    // Processed Records
    // =========================================================================

    /// Inserts a Processed Record.
    ///
    /// A unique-index rejection (either on the message id or the idempotency
    /// key) is surfaced as [`Error::AlreadyProcessed`]: some other delivery
    /// of this operation won the race, which callers treat as success.
    pub async fn insert_processed(&self, record: &ProcessedRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO processed_events
                     (stream_message_id, idempotency_key, event_type, status, processed_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.stream_message_id.as_raw() as i64,
                    record.idempotency_key,
                    record.event_type,
                    record.status.as_str(),
                    record.processed_at_ms as i64,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(Error::AlreadyProcessed {
                    idempotency_key: record.idempotency_key.clone(),
                }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Looks up the Processed Record for an idempotency key, if any.
    pub async fn find_processed_by_key(&self, key: &str) -> Result<Option<ProcessedRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT stream_message_id, idempotency_key, event_type, status, processed_at_ms
                     FROM processed_events WHERE idempotency_key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(id, key, event_type, status, at)| {
                Ok(ProcessedRecord {
                    stream_message_id: MessageId::from_raw_unchecked(id as u64),
                    idempotency_key: key,
                    event_type,
                    status: ProcessedStatus::parse(&status)
                        .ok_or_else(|| Error::Schema(format!("unknown processed status '{status}'")))?,
                    processed_at_ms: at as u64,
                })
            })
            .transpose()
        })
        .await
    }

    /// Number of Processed Records.
    pub async fn processed_count(&self) -> Result<u64> {
        self.count("processed_events").await
    }

    // =========================================================================
    // Retry Records
    // =========================================================================

    /// Looks up the Retry Record for a message id, if any.
    pub async fn find_retry(&self, id: MessageId) -> Result<Option<RetryRecord>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT stream_message_id, idempotency_key, retry_count, last_error,
                            next_retry_at_ms, status
                     FROM retry_events WHERE stream_message_id = ?1",
                    params![id.as_raw() as i64],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(id, key, count, last_error, next_at, status)| {
                Ok(RetryRecord {
                    stream_message_id: MessageId::from_raw_unchecked(id as u64),
                    idempotency_key: key,
                    retry_count: count as u32,
                    last_error,
                    next_retry_at_ms: next_at as u64,
                    status: RetryStatus::parse(&status)
                        .ok_or_else(|| Error::Schema(format!("unknown retry status '{status}'")))?,
                })
            })
            .transpose()
        })
        .await
    }

    /// Inserts or replaces the Retry Record for its message id.
    ///
    /// One conditional write, so concurrent failure reports for the same
    /// entry converge to a single row.
    pub async fn upsert_retry(&self, record: &RetryRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO retry_events
                     (stream_message_id, idempotency_key, retry_count, last_error,
                      next_retry_at_ms, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(stream_message_id) DO UPDATE SET
                     idempotency_key  = excluded.idempotency_key,
                     retry_count      = excluded.retry_count,
                     last_error       = excluded.last_error,
                     next_retry_at_ms = excluded.next_retry_at_ms,
                     status           = excluded.status",
                params![
                    record.stream_message_id.as_raw() as i64,
                    record.idempotency_key,
                    record.retry_count as i64,
                    record.last_error,
                    record.next_retry_at_ms as i64,
                    record.status.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes the Retry Record for a message id, if present.
    pub async fn delete_retry(&self, id: MessageId) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM retry_events WHERE stream_message_id = ?1",
                params![id.as_raw() as i64],
            )?;
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Dead Letters
    // =========================================================================

    /// Appends a Dead-Letter Record. Never mutated or deleted afterwards.
    pub async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO dead_letter_events
                     (event_type, source_message_id, payload, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.event_type,
                    record.source_message_id.as_raw() as i64,
                    record.payload,
                    record.created_at_ms as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Number of Dead-Letter Records.
    pub async fn dead_letter_count(&self) -> Result<u64> {
        self.count("dead_letter_events").await
    }

    /// All Dead-Letter Records, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_type, source_message_id, payload, created_at_ms
                 FROM dead_letter_events ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(DeadLetterRecord {
                    event_type: row.get(0)?,
                    source_message_id: MessageId::from_raw_unchecked(row.get::<_, i64>(1)? as u64),
                    payload: row.get(2)?,
                    created_at_ms: row.get::<_, i64>(3)? as u64,
                })
            })?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    // =========================================================================
    // Projections
    // =========================================================================

    /// Appends a Projection Record (the side effect itself).
    pub async fn insert_projection(&self, record: &ProjectionRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO event_projections
                     (event_type, source_message_id, payload, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.event_type,
                    record.source_message_id.as_raw() as i64,
                    record.payload,
                    record.created_at_ms as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Number of Projection Records.
    pub async fn projection_count(&self) -> Result<u64> {
        self.count("event_projections").await
    }

    async fn count(&self, table: &'static str) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
            Ok(n as u64)
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(id: u64, key: &str) -> ProcessedRecord {
        ProcessedRecord {
            stream_message_id: MessageId::from_raw(id),
            idempotency_key: key.to_string(),
            event_type: "test.event".to_string(),
            status: ProcessedStatus::Processed,
            processed_at_ms: 1_000,
        }
    }

    fn retry(id: u64, count: u32, status: RetryStatus) -> RetryRecord {
        RetryRecord {
            stream_message_id: MessageId::from_raw(id),
            idempotency_key: format!("key-{id}"),
            retry_count: count,
            last_error: "boom".to_string(),
            next_retry_at_ms: 2_000,
            status,
        }
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_rejected_as_already_processed() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_processed(&processed(1, "key-a")).await.unwrap();

        let err = store
            .insert_processed(&processed(2, "key-a"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::AlreadyProcessed { ref idempotency_key } if idempotency_key == "key-a")
        );
        assert_eq!(store.processed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_id_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_processed(&processed(7, "key-a")).await.unwrap();
        let err = store
            .insert_processed(&processed(7, "key-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyProcessed { .. }));
    }

    #[tokio::test]
    async fn test_find_processed_by_key() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.find_processed_by_key("nope").await.unwrap().is_none());

        store.insert_processed(&processed(3, "key-x")).await.unwrap();
        let found = store
            .find_processed_by_key("key-x")
            .await
            .unwrap()
            .expect("record present");
        assert_eq!(found.stream_message_id, MessageId::from_raw(3));
        assert_eq!(found.status, ProcessedStatus::Processed);
    }

    #[tokio::test]
    async fn test_retry_upsert_converges_to_one_row() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .upsert_retry(&retry(5, 1, RetryStatus::Retrying))
            .await
            .unwrap();
        store
            .upsert_retry(&retry(5, 2, RetryStatus::Retrying))
            .await
            .unwrap();
        store
            .upsert_retry(&retry(5, 3, RetryStatus::Dead))
            .await
            .unwrap();

        let record = store
            .find_retry(MessageId::from_raw(5))
            .await
            .unwrap()
            .expect("row present");
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.status, RetryStatus::Dead);
    }

    #[tokio::test]
    async fn test_delete_retry_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .upsert_retry(&retry(9, 1, RetryStatus::Retrying))
            .await
            .unwrap();
        store.delete_retry(MessageId::from_raw(9)).await.unwrap();
        assert!(store.find_retry(MessageId::from_raw(9)).await.unwrap().is_none());
        // Deleting a missing row is fine.
        store.delete_retry(MessageId::from_raw(9)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letters_append_only() {
        let store = StateStore::open_in_memory().unwrap();
        for id in 1..=3u64 {
            store
                .insert_dead_letter(&DeadLetterRecord {
                    event_type: "test.event".to_string(),
                    source_message_id: MessageId::from_raw(id),
                    payload: "{}".to_string(),
                    created_at_ms: id * 100,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.dead_letter_count().await.unwrap(), 3);
        let letters = store.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 3);
        assert_eq!(letters[0].source_message_id, MessageId::from_raw(1));
    }

    #[tokio::test]
    async fn test_projection_count() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .insert_projection(&ProjectionRecord {
                event_type: "test.event".to_string(),
                source_message_id: MessageId::from_raw(1),
                payload: r#"{"seats":2}"#.to_string(),
                created_at_ms: 50,
            })
            .await
            .unwrap();
        assert_eq!(store.projection_count().await.unwrap(), 1);
    }
}
