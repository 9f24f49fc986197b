//! Transactional event outbox and its polling receiver.
//!
//! [`publish_in_tx`] appends one row to `internal_event_queue` using the
//! caller's connection, so inside an import transaction the event commits
//! or rolls back atomically with the business write it describes. The
//! [`EventReceiver`] drains the queue at-least-once: oldest rows first,
//! acknowledged by delete. Consumers must be idempotent; the dedup ledger
//! exists for exactly that.

use deadwood_core::events::DomainEvent;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{Database, now_millis};
use crate::lock::{LockManager, LockSpec};

/// Lock serializing receiver polls across processes.
const RECEIVER_LOCK: LockSpec = LockSpec::Task("event-receiver");

/// Errors raised by outbox operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OutboxError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The event could not be serialized.
    #[error("cannot serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Lock layer failure (not ordinary contention).
    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),
}

/// One drained outbox row.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Queue row id; ordering and acknowledgement key.
    pub id: i64,

    /// Correlation id carried from the producing import.
    pub correlation_id: Uuid,

    /// The deserialized event.
    pub event: DomainEvent,
}

/// Appends an event to the outbox on the caller's connection.
///
/// Call inside the business transaction; the row commits with it. A
/// correlation id is generated when the caller has none.
///
/// # Errors
///
/// Returns [`OutboxError`] on serialization or insert failure.
pub fn publish_in_tx(
    conn: &Connection,
    event: &DomainEvent,
    correlation_id: Option<Uuid>,
) -> Result<Uuid, OutboxError> {
    let correlation_id = correlation_id.unwrap_or_else(Uuid::new_v4);
    let payload = serde_json::to_string(event)?;
    conn.execute(
        "INSERT INTO internal_event_queue (type, correlation_id, payload, created_at_millis)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event.type_tag(),
            correlation_id.to_string(),
            payload,
            now_millis()
        ],
    )?;
    debug!(event_type = event.type_tag(), %correlation_id, "event queued");
    Ok(correlation_id)
}

/// Drains the outbox in publish order.
#[derive(Clone)]
pub struct EventReceiver {
    db: Database,
    locks: LockManager,
    batch_size: usize,
}

impl EventReceiver {
    /// Creates a receiver draining up to `batch_size` rows per poll.
    #[must_use]
    pub const fn new(db: Database, locks: LockManager, batch_size: usize) -> Self {
        Self {
            db,
            locks,
            batch_size,
        }
    }

    /// Selects the oldest rows, ascending by id.
    ///
    /// Runs under the receiver task lock; contention returns an empty
    /// batch, not an error. Rows whose stored type no longer deserializes
    /// are deleted and logged; retrying them forever would wedge the
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on database failure.
    pub fn poll(&self) -> Result<Vec<QueuedEvent>, OutboxError> {
        let Some(_guard) = self.locks.try_acquire(&RECEIVER_LOCK)? else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        let mut poison = Vec::new();
        {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT id, type, correlation_id, payload FROM internal_event_queue
                 ORDER BY id ASC LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![self.batch_size as i64])?;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let type_tag: String = row.get(1)?;
                let correlation_id: String = row.get(2)?;
                let payload: String = row.get(3)?;

                let correlation_id = Uuid::parse_str(&correlation_id).unwrap_or_default();
                match serde_json::from_str::<DomainEvent>(&payload) {
                    Ok(event) => events.push(QueuedEvent {
                        id,
                        correlation_id,
                        event,
                    }),
                    Err(e) => {
                        warn!(id, type_tag = %type_tag, error = %e,
                              "dropping outbox row that no longer deserializes");
                        poison.push(id);
                    }
                }
            }
        }

        if !poison.is_empty() {
            self.delete_ids(&poison)?;
        }
        Ok(events)
    }

    /// Acknowledges drained events by deleting their rows.
    ///
    /// A partial delete is a warning, not an error: the remaining rows are
    /// simply redelivered on the next poll.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on database failure.
    pub fn acknowledge(&self, events: &[QueuedEvent]) -> Result<(), OutboxError> {
        if events.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let deleted = self.delete_ids(&ids)?;
        if deleted < ids.len() {
            warn!(
                requested = ids.len(),
                deleted, "partial outbox acknowledge; remainder will be redelivered"
            );
        }
        Ok(())
    }

    /// Rows currently waiting in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on database failure.
    pub fn depth(&self) -> Result<i64, OutboxError> {
        let conn = self.db.lock();
        Ok(conn.query_row("SELECT count(*) FROM internal_event_queue", [], |row| {
            row.get(0)
        })?)
    }

    fn delete_ids(&self, ids: &[i64]) -> Result<usize, OutboxError> {
        let conn = self.db.lock();
        let mut deleted = 0;
        let mut stmt = conn.prepare("DELETE FROM internal_event_queue WHERE id = ?1")?;
        for id in ids {
            deleted += stmt.execute(params![id])?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn setup() -> (Database, EventReceiver) {
        let db = Database::in_memory().expect("db");
        let locks = LockManager::new(db.clone(), Duration::from_secs(300));
        let receiver = EventReceiver::new(db.clone(), locks, 10);
        (db, receiver)
    }

    fn sample_event(customer_id: i64) -> DomainEvent {
        DomainEvent::CustomerWeeded {
            customer_id,
            deleted_jvms: 1,
            deleted_invocations: 0,
            deleted_methods: 0,
            deleted_applications: 0,
            deleted_environments: 0,
        }
    }

    #[test]
    fn publish_poll_acknowledge_round_trip() {
        let (db, receiver) = setup();
        {
            let conn = db.lock();
            publish_in_tx(&conn, &sample_event(1), None).expect("publish 1");
            publish_in_tx(&conn, &sample_event(2), None).expect("publish 2");
        }

        let batch = receiver.poll().expect("poll");
        assert_eq!(batch.len(), 2);
        // Publish order preserved.
        assert_eq!(batch[0].event.customer_id(), 1);
        assert_eq!(batch[1].event.customer_id(), 2);
        assert!(batch[0].id < batch[1].id);

        receiver.acknowledge(&batch).expect("ack");
        assert!(receiver.poll().expect("poll").is_empty());
        assert_eq!(receiver.depth().expect("depth"), 0);
    }

    #[test]
    fn supplied_correlation_id_is_preserved() {
        let (db, receiver) = setup();
        let correlation_id = Uuid::new_v4();
        {
            let conn = db.lock();
            let returned =
                publish_in_tx(&conn, &sample_event(1), Some(correlation_id)).expect("publish");
            assert_eq!(returned, correlation_id);
        }
        let batch = receiver.poll().expect("poll");
        assert_eq!(batch[0].correlation_id, correlation_id);
    }

    #[test]
    fn rollback_discards_the_event() {
        let (db, receiver) = setup();
        {
            let mut conn = db.lock();
            let tx = conn.transaction().expect("tx");
            publish_in_tx(&tx, &sample_event(1), None).expect("publish");
            tx.rollback().expect("rollback");
        }
        assert!(receiver.poll().expect("poll").is_empty());
    }

    #[test]
    fn unresolvable_rows_are_dropped_not_retried() {
        let (db, receiver) = setup();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO internal_event_queue (type, correlation_id, payload, created_at_millis)
                 VALUES ('legacy.event', 'not-a-uuid', '{\"type\":\"legacy.event\"}', 1)",
                [],
            )
            .expect("insert poison row");
            publish_in_tx(&conn, &sample_event(1), None).expect("publish good");
        }

        let batch = receiver.poll().expect("poll");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event.customer_id(), 1);

        // Poison row was deleted, not left for the next poll.
        assert_eq!(receiver.depth().expect("depth"), 1);
    }

    #[test]
    fn poll_under_contention_returns_empty_batch() {
        let (db, receiver) = setup();
        {
            let conn = db.lock();
            publish_in_tx(&conn, &sample_event(1), None).expect("publish");
        }
        let locks = LockManager::new(db, Duration::from_secs(300));
        let _held = locks
            .try_acquire(&LockSpec::Task("event-receiver"))
            .expect("claim")
            .expect("free");

        assert!(receiver.poll().expect("poll").is_empty());
    }
}
