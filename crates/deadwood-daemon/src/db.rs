//! SQLite connection handling.
//!
//! One shared connection behind a mutex, WAL mode, schema applied on open.
//! The in-memory constructor exists for tests; everything else goes through
//! a file-backed database.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors raised while opening or initializing the database.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handle to the daemon database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (creating if needed) a file-backed database and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the file cannot be opened or the schema
    /// fails to apply.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when schema initialization fails.
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the shared connection. A poisoned mutex is recovered rather
    /// than propagated: SQLite state is consistent after a panicked holder
    /// because every write path uses transactions.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Wall-clock now in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// True when the error is SQLite-level contention (`SQLITE_BUSY` /
/// `SQLITE_LOCKED`) that a bounded retry may resolve.
#[must_use]
pub fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// True when the error is a uniqueness/constraint violation.
#[must_use]
pub fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_database_has_schema() {
        let db = Database::in_memory().expect("in-memory db");
        let conn = db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('applications', 'environments', 'jvms', 'methods', 'method_locations',
                  'truncated_signatures', 'invocations', 'codebase_fingerprints',
                  'synthetic_signature_patterns', 'internal_event_queue', 'message_ids',
                  'internal_locks', 'customers')",
                [],
                |row| row.get(0),
            )
            .expect("query table count");
        assert_eq!(count, 13);
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("dw.db");
        drop(Database::open(&path).expect("first open"));
        drop(Database::open(&path).expect("second open"));
    }

    #[test]
    fn constraint_violation_is_recognized() {
        let db = Database::in_memory().expect("db");
        let conn = db.lock();
        conn.execute(
            "INSERT INTO message_ids (message_id, recorded_at_millis) VALUES ('m1', 1)",
            [],
        )
        .expect("first insert");
        let err = conn
            .execute(
                "INSERT INTO message_ids (message_id, recorded_at_millis) VALUES ('m1', 2)",
                [],
            )
            .expect_err("duplicate must fail");
        assert!(is_constraint_violation(&err));
        assert!(!is_busy(&err));
    }
}
