//! Message deduplication ledger.
//!
//! Delivery is at-least-once everywhere in this system; consumers call
//! [`MessageIdLedger::remember`] before acting and treat
//! [`DedupError::Duplicate`] as "already done, discard". The ledger is a
//! single unique-keyed table so the distinction between first delivery and
//! redelivery is the database's, not a read-then-write race.

use rusqlite::params;
use thiserror::Error;
use tracing::debug;

use crate::db::{Database, is_constraint_violation, now_millis};

/// Errors raised by the dedup ledger.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DedupError {
    /// The message id was already recorded; the caller should discard the
    /// redelivery as a no-op.
    #[error("duplicate message id: {message_id}")]
    Duplicate {
        /// The id that was already processed.
        message_id: String,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Records message identifiers already processed.
#[derive(Clone)]
pub struct MessageIdLedger {
    db: Database,
}

impl MessageIdLedger {
    /// Creates a ledger over the shared database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records a message id.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::Duplicate`] when the id was already recorded
    /// and [`DedupError::Database`] for any other failure.
    pub fn remember(&self, message_id: &str) -> Result<(), DedupError> {
        let conn = self.db.lock();
        match conn.execute(
            "INSERT INTO message_ids (message_id, recorded_at_millis) VALUES (?1, ?2)",
            params![message_id, now_millis()],
        ) {
            Ok(_) => {
                debug!(message_id, "recorded message id");
                Ok(())
            }
            Err(e) if is_constraint_violation(&e) => Err(DedupError::Duplicate {
                message_id: message_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_remember_is_a_distinguishable_duplicate() {
        let ledger = MessageIdLedger::new(Database::in_memory().expect("db"));

        ledger.remember("msg-1").expect("first remember");
        let err = ledger.remember("msg-1").expect_err("second must fail");
        assert!(matches!(err, DedupError::Duplicate { ref message_id } if message_id == "msg-1"));

        // Exactly one ledger row.
        let db = &ledger.db;
        let conn = db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM message_ids WHERE message_id = 'msg-1'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn distinct_ids_are_independent() {
        let ledger = MessageIdLedger::new(Database::in_memory().expect("db"));
        ledger.remember("msg-a").expect("a");
        ledger.remember("msg-b").expect("b");
    }
}
