//! Background weeding: retention-driven reclamation of dead rows.
//!
//! Agents disappear without deregistering, so the database accumulates JVM
//! rows nobody will ever publish for again, and with them applications,
//! environments, methods, and invocations nothing references. Weeding
//! restores the consistency external actors cannot: per customer it deletes
//! JVMs past the retention boundary, then everything orphaned as a result,
//! always in dependency order (invocations before methods) so a method row
//! is never deleted while a live invocation still references it.

use deadwood_core::events::DomainEvent;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::customer::{CustomerDirectory, CustomerError};
use crate::db::{Database, is_busy, now_millis};
use crate::lock::{LockManager, LockSpec};
use crate::metrics::ImportMetrics;
use crate::outbox;

/// Lock serializing weeding across processes.
const WEEDING_LOCK: LockSpec = LockSpec::Task("weeding");

/// Attempts for side writes that may lose a deadlock/busy race.
const SIDE_WRITE_ATTEMPTS: u32 = 3;

/// Errors raised by the weeding task.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WeedingError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Lock layer failure.
    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    /// Outbox failure while emitting the weeded event.
    #[error("outbox error: {0}")]
    Outbox(#[from] crate::outbox::OutboxError),
}

/// Rows reclaimed for one customer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeedingReport {
    pub jvms: usize,
    pub invocations: usize,
    pub methods: usize,
    pub applications: usize,
    pub environments: usize,
}

impl WeedingReport {
    /// True when nothing was deleted.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.jvms == 0
            && self.invocations == 0
            && self.methods == 0
            && self.applications == 0
            && self.environments == 0
    }
}

/// Periodic reconciliation task.
pub struct WeedingTask {
    db: Database,
    locks: LockManager,
    customers: std::sync::Arc<dyn CustomerDirectory>,
    metrics: ImportMetrics,
    default_retention_millis: i64,
}

impl WeedingTask {
    /// Creates the task with the daemon-wide default retention.
    #[must_use]
    pub fn new(
        db: Database,
        locks: LockManager,
        customers: std::sync::Arc<dyn CustomerDirectory>,
        metrics: ImportMetrics,
        default_retention_millis: i64,
    ) -> Self {
        Self {
            db,
            locks,
            customers,
            metrics,
            default_retention_millis,
        }
    }

    /// Runs one weeding pass over every customer with data.
    ///
    /// Runs under the weeding task lock; contention means another process
    /// is already at it, which is success, not failure.
    ///
    /// # Errors
    ///
    /// Returns [`WeedingError`] on database failure.
    pub fn run(&self) -> Result<(), WeedingError> {
        let Some(_guard) = self.locks.try_acquire(&WEEDING_LOCK)? else {
            debug!("weeding already running elsewhere");
            return Ok(());
        };

        let customer_ids: Vec<i64> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT customer_id FROM jvms
                 UNION SELECT DISTINCT customer_id FROM applications",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for customer_id in customer_ids {
            let report = self.weed_customer(customer_id)?;
            if !report.is_empty() {
                info!(customer_id, ?report, "weeded customer");
            }
        }
        Ok(())
    }

    /// Weeds one customer and returns what was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`WeedingError`] on database failure.
    pub fn weed_customer(&self, customer_id: i64) -> Result<WeedingReport, WeedingError> {
        let now = now_millis();
        let cutoff = self.retention_cutoff(customer_id, now);

        // Marking dead agents is a side write that can lose a busy race to
        // a concurrent import; bounded retry, invisible to the caller.
        self.mark_garbage_with_retry(customer_id, cutoff)?;

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let report = weed_in_tx(&tx, customer_id)?;

        if !report.is_empty() {
            outbox::publish_in_tx(
                &tx,
                &DomainEvent::CustomerWeeded {
                    customer_id,
                    deleted_jvms: report.jvms,
                    deleted_invocations: report.invocations,
                    deleted_methods: report.methods,
                    deleted_applications: report.applications,
                    deleted_environments: report.environments,
                },
                None,
            )?;
        }
        tx.commit()?;

        self.metrics.record_weeded("jvms", report.jvms);
        self.metrics.record_weeded("invocations", report.invocations);
        self.metrics.record_weeded("methods", report.methods);
        self.metrics.record_weeded("applications", report.applications);
        self.metrics.record_weeded("environments", report.environments);
        Ok(report)
    }

    /// Cutoff below which a JVM's `published_at_millis` makes it garbage:
    /// the retention boundary, pushed forward to the trial end once an
    /// expired trial stops the clock.
    fn retention_cutoff(&self, customer_id: i64, now: i64) -> i64 {
        let (retention_millis, trial_ends_at) = match self.customers.settings(customer_id) {
            Ok(s) => (
                s.retention_days
                    .map_or(self.default_retention_millis, |d| i64::from(d) * 86_400_000),
                s.trial_ends_at_millis,
            ),
            Err(CustomerError::NotFound { .. }) => (self.default_retention_millis, None),
            Err(e) => {
                warn!(customer_id, error = %e, "customer lookup failed; using default retention");
                (self.default_retention_millis, None)
            }
        };

        let mut cutoff = now - retention_millis;
        if let Some(trial_end) = trial_ends_at {
            if now > trial_end {
                cutoff = cutoff.max(trial_end);
            }
        }
        cutoff
    }

    fn mark_garbage_with_retry(&self, customer_id: i64, cutoff: i64) -> Result<(), WeedingError> {
        let mut attempt = 0;
        loop {
            let result = {
                let conn = self.db.lock();
                conn.execute(
                    "UPDATE jvms SET garbage = 1
                     WHERE customer_id = ?1 AND published_at_millis < ?2",
                    params![customer_id, cutoff],
                )
            };
            match result {
                Ok(marked) => {
                    if marked > 0 {
                        debug!(customer_id, marked, "marked dead agents as garbage");
                    }
                    return Ok(());
                }
                Err(e) if is_busy(&e) && attempt < SIDE_WRITE_ATTEMPTS => {
                    attempt += 1;
                    warn!(customer_id, attempt, "busy while marking dead agents; retrying");
                    std::thread::sleep(std::time::Duration::from_millis(25 * u64::from(attempt)));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The deletion sequence, dependency order. Split out so tests can drive
/// it against a prepared transaction.
fn weed_in_tx(tx: &Connection, customer_id: i64) -> Result<WeedingReport, WeedingError> {
    let jvms = tx.execute(
        "DELETE FROM jvms WHERE customer_id = ?1 AND garbage = 1",
        [customer_id],
    )?;

    // Invocations first: their application lost its last JVM.
    let invocations = tx.execute(
        "DELETE FROM invocations WHERE customer_id = ?1 AND application_id NOT IN
           (SELECT DISTINCT application_id FROM jvms WHERE customer_id = ?1)",
        [customer_id],
    )?;

    // Methods only after invocations, so nothing referenced is deleted.
    let methods = tx.execute(
        "DELETE FROM methods WHERE customer_id = ?1 AND id NOT IN
           (SELECT DISTINCT method_id FROM invocations WHERE customer_id = ?1)",
        [customer_id],
    )?;
    tx.execute(
        "DELETE FROM method_locations WHERE customer_id = ?1 AND method_id NOT IN
           (SELECT id FROM methods WHERE customer_id = ?1)",
        [customer_id],
    )?;
    tx.execute(
        "DELETE FROM truncated_signatures WHERE customer_id = ?1 AND truncated_signature NOT IN
           (SELECT signature FROM methods WHERE customer_id = ?1)",
        [customer_id],
    )?;

    let applications = tx.execute(
        "DELETE FROM applications WHERE customer_id = ?1 AND id NOT IN
           (SELECT DISTINCT application_id FROM jvms WHERE customer_id = ?1)",
        [customer_id],
    )?;
    tx.execute(
        "DELETE FROM codebase_fingerprints WHERE customer_id = ?1 AND application_id NOT IN
           (SELECT id FROM applications WHERE customer_id = ?1)",
        [customer_id],
    )?;
    let environments = tx.execute(
        "DELETE FROM environments WHERE customer_id = ?1 AND id NOT IN
           (SELECT DISTINCT environment_id FROM jvms WHERE customer_id = ?1)",
        [customer_id],
    )?;

    Ok(WeedingReport {
        jvms,
        invocations,
        methods,
        applications,
        environments,
    })
}
