//! Named, scoped mutual-exclusion locks backed by the database.
//!
//! A lock is one row in `internal_locks`; acquisition is an atomic claim
//! inside an immediate transaction so contention is detected right away
//! instead of through blocking row locks. Two entry points exist on
//! purpose: [`LockManager::try_acquire`] fails fast, [`LockManager::acquire`]
//! waits up to a bounded timeout with jittered backoff. Ordinary contention
//! is `Ok(None)`, never an error; [`LockManager::acquire_or_fail`] is the
//! variant for callers with no fallback, mapping timeout to a retryable
//! error.
//!
//! # Crashed holders
//!
//! A lock row carries only its acquisition timestamp; there is no
//! heartbeat liveness. A holder that dies without releasing leaves the row
//! behind; recovery is TTL takeover: a claim attempt first deletes rows
//! older than the configured TTL. Operators sizing the TTL must keep it
//! above the longest legitimate import.

use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::{TransactionBehavior, params};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{Database, is_busy, now_millis};

/// Base sleep between claim attempts in the bounded-wait variant.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Upper bound on one backoff sleep.
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Errors raised by lock operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The bounded wait expired without acquiring the lock. Retryable by
    /// construction: the caller is expected to re-run the whole operation.
    #[error("timed out waiting for lock '{key}'")]
    Timeout {
        /// The contended lock key.
        key: String,
    },
}

/// What a lock protects. Keys are namespaced so scopes never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockSpec {
    /// Serializes all imports for one customer.
    Customer(i64),

    /// Serializes one named background task across processes.
    Task(&'static str),

    /// Whole-system maintenance.
    System,

    /// Guards one publication file against concurrent processing.
    Publication(String),
}

impl LockSpec {
    /// Row key in `internal_locks`.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Customer(id) => format!("customer:{id}"),
            Self::Task(name) => format!("task:{name}"),
            Self::System => "system".to_string(),
            Self::Publication(file) => format!("publication:{file}"),
        }
    }
}

/// Acquires and releases named locks.
#[derive(Clone)]
pub struct LockManager {
    db: Database,
    ttl: Duration,
}

impl LockManager {
    /// Creates a manager with the given stale-takeover TTL.
    #[must_use]
    pub const fn new(db: Database, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Attempts to claim the lock without waiting.
    ///
    /// Returns `Ok(None)` on contention, including when the claim
    /// transaction itself loses to a concurrent writer.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Database`] only for non-contention failures.
    pub fn try_acquire(&self, spec: &LockSpec) -> Result<Option<LockGuard>, LockError> {
        let key = spec.key();
        let now = now_millis();
        let stale_cutoff = now - i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);

        let mut conn = self.db.lock();
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_busy(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let taken_over = tx.execute(
            "DELETE FROM internal_locks WHERE name = ?1 AND acquired_at_millis <= ?2",
            params![key, stale_cutoff],
        )?;
        if taken_over > 0 {
            warn!(lock = %key, "taking over lock past its TTL (holder presumed dead)");
        }

        let claimed = tx.execute(
            "INSERT INTO internal_locks (name, acquired_at_millis) VALUES (?1, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![key, now],
        )?;
        tx.commit()?;
        drop(conn);

        if claimed == 1 {
            debug!(lock = %key, "acquired");
            Ok(Some(LockGuard {
                db: self.db.clone(),
                key,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Claims the lock, waiting up to `timeout` with jittered backoff.
    ///
    /// Returns `Ok(None)` when the timeout expires; timeouts are ordinary
    /// contention, not errors.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Database`] for non-contention failures.
    pub fn acquire(
        &self,
        spec: &LockSpec,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;
        loop {
            if let Some(guard) = self.try_acquire(spec)? {
                return Ok(Some(guard));
            }
            if Instant::now() >= deadline {
                debug!(lock = %spec.key(), "bounded wait expired");
                return Ok(None);
            }
            let backoff = BACKOFF_BASE
                .saturating_mul(1u32 << attempt.min(4))
                .min(BACKOFF_MAX);
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..BACKOFF_BASE);
            std::thread::sleep((backoff + jitter).min(deadline.saturating_duration_since(Instant::now())));
            attempt = attempt.saturating_add(1);
        }
    }

    /// [`Self::acquire`] for callers with no fallback: a timeout aborts the
    /// whole operation with a retryable [`LockError::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] when the wait expires and
    /// [`LockError::Database`] for non-contention failures.
    pub fn acquire_or_fail(
        &self,
        spec: &LockSpec,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        self.acquire(spec, timeout)?
            .ok_or_else(|| LockError::Timeout { key: spec.key() })
    }
}

/// A held lock. Released explicitly or on drop; release is idempotent.
pub struct LockGuard {
    db: Database,
    key: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// The row key this guard holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Database`] when the delete itself fails; a row
    /// already gone (TTL takeover) is logged, not an error.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let conn = self.db.lock();
        let deleted = conn.execute(
            "DELETE FROM internal_locks WHERE name = ?1",
            params![self.key],
        )?;
        if deleted == 0 {
            warn!(lock = %self.key, "lock row already gone on release (taken over?)");
        } else {
            debug!(lock = %self.key, "released");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(lock = %self.key, error = %e, "failed to release lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new(
            Database::in_memory().expect("db"),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn try_acquire_then_contention() {
        let locks = manager();
        let spec = LockSpec::Customer(1);

        let guard = locks.try_acquire(&spec).expect("claim").expect("free lock");
        assert_eq!(guard.key(), "customer:1");

        // Second claim sees contention, not an error.
        assert!(locks.try_acquire(&spec).expect("claim").is_none());

        drop(guard);
        assert!(locks.try_acquire(&spec).expect("claim").is_some());
    }

    #[test]
    fn scopes_do_not_collide() {
        let locks = manager();
        let _customer = locks
            .try_acquire(&LockSpec::Customer(1))
            .expect("claim")
            .expect("free");
        assert!(locks
            .try_acquire(&LockSpec::Task("weeding"))
            .expect("claim")
            .is_some());
        assert!(locks
            .try_acquire(&LockSpec::Publication("f.json".to_string()))
            .expect("claim")
            .is_some());
        assert!(locks.try_acquire(&LockSpec::System).expect("claim").is_some());
    }

    #[test]
    fn bounded_wait_times_out_as_none() {
        let locks = manager();
        let spec = LockSpec::Customer(2);
        let _held = locks.try_acquire(&spec).expect("claim").expect("free");

        let waited = locks
            .acquire(&spec, Duration::from_millis(150))
            .expect("wait");
        assert!(waited.is_none());
    }

    #[test]
    fn acquire_or_fail_maps_timeout_to_error() {
        let locks = manager();
        let spec = LockSpec::Customer(3);
        let _held = locks.try_acquire(&spec).expect("claim").expect("free");

        let err = locks
            .acquire_or_fail(&spec, Duration::from_millis(100))
            .expect_err("must time out");
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let db = Database::in_memory().expect("db");
        let locks = LockManager::new(db.clone(), Duration::from_millis(10));
        let spec = LockSpec::Customer(4);

        // Simulate a crashed holder: row exists, guard lost.
        let mut guard = locks.try_acquire(&spec).expect("claim").expect("free");
        guard.released = true; // leak the row
        drop(guard);

        std::thread::sleep(Duration::from_millis(20));
        assert!(locks.try_acquire(&spec).expect("claim").is_some());
    }

    #[test]
    fn release_is_idempotent() {
        let locks = manager();
        let mut guard = locks
            .try_acquire(&LockSpec::System)
            .expect("claim")
            .expect("free");
        guard.release().expect("first release");
        guard.release().expect("second release");
    }
}
