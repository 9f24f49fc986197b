//! Publication importers and the retry-vs-fatal error taxonomy.
//!
//! Three layers: [`PublicationFileImporter`] owns per-file locking,
//! deserialization, dispatch, and outcome classification;
//! [`CodeBaseImporter`] and [`InvocationDataImporter`] each run one
//! publication end to end as a single transaction under the customer lock.
//!
//! The taxonomy is explicit rather than inferred from strings:
//! [`ImportError::is_retryable`] marks transient conditions (lock
//! contention, busy database) the caller resolves by leaving the file for a
//! later pass, and [`ImportError::is_unrecoverable`] marks conditions a
//! retry cannot fix (malformed or schema-incompatible files, license
//! violations, unknown customers), which are dropped forever. Everything
//! else is the default "unknown, assume transient" bucket, logged at error
//! severity.

mod codebase;
mod file;
mod invocations;

use std::sync::Arc;
use std::time::Duration;

pub use codebase::CodeBaseImporter;
use deadwood_core::model::PublicationError;
pub use file::PublicationFileImporter;
pub use invocations::InvocationDataImporter;
use thiserror::Error;

use crate::customer::{CustomerDirectory, CustomerError};
use crate::db::{Database, is_busy};
use crate::dao::DaoError;
use crate::lock::{LockError, LockManager};
use crate::metrics::ImportMetrics;
use crate::outbox::OutboxError;
use crate::patterns::{PatternError, SyntheticFilterService};

/// Errors raised while importing a publication.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImportError {
    /// The publication is malformed or of an incompatible format version.
    #[error(transparent)]
    Publication(#[from] PublicationError),

    /// Customer lookup or plan check failed.
    #[error(transparent)]
    Customer(#[from] CustomerError),

    /// Lock layer failure; a timeout here is the "try again" signal.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// DAO failure.
    #[error(transparent)]
    Dao(#[from] DaoError),

    /// Outbox failure.
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Synthetic filter failure.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Direct database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ImportError {
    /// True for transient conditions: retrying the same file later is
    /// expected to succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Lock(LockError::Timeout { .. }) => true,
            Self::Lock(LockError::Database(e)) | Self::Database(e) => is_busy(e),
            Self::Dao(DaoError::Database(e)) => is_busy(e),
            Self::Outbox(OutboxError::Database(e)) | Self::Pattern(PatternError::Database(e)) => {
                is_busy(e)
            }
            Self::Customer(CustomerError::Database(e)) => is_busy(e),
            _ => false,
        }
    }

    /// True for conditions no retry can fix; the input is dropped forever.
    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::Publication(
                PublicationError::Deserialize(_) | PublicationError::Validation(_)
            ) | Self::Customer(
                CustomerError::LicenseViolation { .. } | CustomerError::NotFound { .. }
            )
        )
    }
}

/// Shared collaborators for all importers.
#[derive(Clone)]
pub struct ImportContext {
    /// Shared database handle.
    pub db: Database,

    /// Lock manager over the same database.
    pub locks: LockManager,

    /// Synthetic-signature filter.
    pub filter: Arc<SyntheticFilterService>,

    /// Customer registry seam.
    pub customers: Arc<dyn CustomerDirectory>,

    /// Metrics sink.
    pub metrics: ImportMetrics,

    /// Environment name used when the agent reports an empty string.
    pub default_environment: String,

    /// Bound on the customer-lock wait.
    pub lock_wait: Duration,
}

impl ImportContext {
    /// Environment name with the empty-string default applied.
    #[must_use]
    pub fn resolve_environment<'a>(&'a self, reported: &'a str) -> &'a str {
        let trimmed = reported.trim();
        if trimmed.is_empty() {
            &self.default_environment
        } else {
            trimmed
        }
    }
}
