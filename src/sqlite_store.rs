//! SQLite-backed record store.
//!
//! One row per identifier holding the JSON-encoded record, so restarts keep
//! counts, scores and pending CAPTCHA requirements.
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::StoreError;
use crate::rate_limit::IdentifierRecord;
use crate::store::RecordStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS admission_records (
     identifier  TEXT PRIMARY KEY,
     record_json TEXT NOT NULL,
     updated_at  INTEGER NOT NULL
 );";

/// Holds a single connection. Statements from different identifiers queue on
/// it, which caps throughput at one SQLite statement at a time; actor
/// ordering per identifier does not depend on it.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        info!(journal_mode = %mode, "SqliteStore opened at {:?}", path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn load(&self, identifier: &str) -> Result<Option<IdentifierRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM admission_records WHERE identifier = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, identifier: &str, record: &IdentifierRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO admission_records (identifier, record_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(identifier) DO UPDATE SET
                 record_json = excluded.record_json,
                 updated_at = excluded.updated_at",
            params![identifier, json, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM admission_records WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(removed > 0)
    }
}
