//! Customer directory seam.
//!
//! Customers are owned by an external billing service; this engine only
//! reads them. The trait keeps importers testable against a fixed
//! directory, and the SQLite implementation reads the `customers` table the
//! external service maintains.

use thiserror::Error;

use crate::db::Database;

/// Errors raised by customer lookups and plan checks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CustomerError {
    /// No such customer. Publications for unknown customers are
    /// unrecoverable; retrying cannot make the tenant exist.
    #[error("unknown customer: {customer_id}")]
    NotFound {
        /// The customer id the publication carried.
        customer_id: i64,
    },

    /// The customer's plan limit is exceeded. Handled like a policy
    /// violation: the file is not retried, the agent republishes later.
    #[error("customer {customer_id} exceeds plan limit: {method_count} methods > {max_methods}")]
    LicenseViolation {
        /// The offending customer.
        customer_id: i64,
        /// Methods currently stored.
        method_count: i64,
        /// Plan ceiling.
        max_methods: i64,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Per-customer settings the import engine needs.
#[derive(Debug, Clone)]
pub struct CustomerSettings {
    /// The customer id.
    pub customer_id: i64,

    /// Retention override in days; `None` means use the daemon default.
    pub retention_days: Option<u32>,

    /// Trial boundary, epoch millis; `None` when not a trial.
    pub trial_ends_at_millis: Option<i64>,

    /// Plan ceiling on stored methods.
    pub max_methods: i64,
}

/// Read-only view of the customer registry.
pub trait CustomerDirectory: Send + Sync {
    /// Looks up one customer's settings.
    ///
    /// # Errors
    ///
    /// Returns [`CustomerError::NotFound`] for unknown customers.
    fn settings(&self, customer_id: i64) -> Result<CustomerSettings, CustomerError>;

    /// Asserts the customer's stored data is within plan limits.
    ///
    /// # Errors
    ///
    /// Returns [`CustomerError::LicenseViolation`] when over the ceiling.
    fn assert_database_size(&self, customer_id: i64) -> Result<(), CustomerError>;
}

/// Directory backed by the `customers` table.
#[derive(Clone)]
pub struct SqliteCustomerDirectory {
    db: Database,
}

impl SqliteCustomerDirectory {
    /// Creates a directory over the shared database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }
}

impl CustomerDirectory for SqliteCustomerDirectory {
    fn settings(&self, customer_id: i64) -> Result<CustomerSettings, CustomerError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT retention_days, trial_ends_at_millis, plan_max_methods
             FROM customers WHERE id = ?1",
        )?;
        let mut rows = stmt.query([customer_id])?;
        let Some(row) = rows.next()? else {
            return Err(CustomerError::NotFound { customer_id });
        };
        Ok(CustomerSettings {
            customer_id,
            retention_days: row.get::<_, Option<i64>>(0)?.and_then(|d| u32::try_from(d).ok()),
            trial_ends_at_millis: row.get(1)?,
            max_methods: row.get(2)?,
        })
    }

    fn assert_database_size(&self, customer_id: i64) -> Result<(), CustomerError> {
        let settings = self.settings(customer_id)?;
        let conn = self.db.lock();
        let method_count: i64 = conn.query_row(
            "SELECT count(*) FROM methods WHERE customer_id = ?1",
            [customer_id],
            |row| row.get(0),
        )?;
        if method_count > settings.max_methods {
            return Err(CustomerError::LicenseViolation {
                customer_id,
                method_count,
                max_methods: settings.max_methods,
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::insert_customer;
    use super::*;

    #[test]
    fn unknown_customer_is_not_found() {
        let db = Database::in_memory().expect("db");
        let directory = SqliteCustomerDirectory::new(db);
        let err = directory.settings(42).expect_err("unknown");
        assert!(matches!(err, CustomerError::NotFound { customer_id: 42 }));
    }

    #[test]
    fn size_assertion_trips_over_the_ceiling() {
        let db = Database::in_memory().expect("db");
        insert_customer(&db, 1, 2);
        {
            let conn = db.lock();
            for i in 0..3 {
                conn.execute(
                    "INSERT INTO methods (customer_id, signature, created_at_millis)
                     VALUES (1, ?1, 0)",
                    [format!("com.shop.M.m{i}()")],
                )
                .expect("insert method");
            }
        }
        let directory = SqliteCustomerDirectory::new(db);
        let err = directory.assert_database_size(1).expect_err("over limit");
        assert!(matches!(
            err,
            CustomerError::LicenseViolation {
                method_count: 3,
                max_methods: 2,
                ..
            }
        ));
    }

    #[test]
    fn size_assertion_passes_within_plan() {
        let db = Database::in_memory().expect("db");
        insert_customer(&db, 1, 100);
        let directory = SqliteCustomerDirectory::new(db);
        directory.assert_database_size(1).expect("within plan");
    }
}
