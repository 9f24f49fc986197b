//! Database-backed synthetic-signature filter.
//!
//! Glues the operator-editable `synthetic_signature_patterns` table to the
//! cached matcher in `deadwood-core`. Refresh loads the non-rejected rows
//! and hands them to the matcher; patterns the matcher rejects (invalid
//! regex) are marked with their error message so they are excluded from
//! every future load instead of crashing each import.

use deadwood_core::synthetic::SyntheticSignatureMatcher;
use rusqlite::params;
use thiserror::Error;
use tracing::info;

use crate::db::Database;

/// Errors raised by the filter service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PatternError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Synthetic-signature filter over the live pattern table.
pub struct SyntheticFilterService {
    db: Database,
    matcher: SyntheticSignatureMatcher,
}

impl SyntheticFilterService {
    /// Creates the service with the built-in fallback active.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            matcher: SyntheticSignatureMatcher::new(),
        }
    }

    /// Reloads the active pattern set, marking invalid patterns rejected.
    ///
    /// Cheap when nothing changed: the matcher recompiles only when the
    /// pattern set's stamp differs.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] on database failure.
    pub fn refresh(&self) -> Result<(), PatternError> {
        let patterns: Vec<String> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT pattern FROM synthetic_signature_patterns
                 WHERE error_message IS NULL ORDER BY pattern",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let rejected = self.matcher.refresh(&patterns);
        if !rejected.is_empty() {
            let conn = self.db.lock();
            for r in &rejected {
                conn.execute(
                    "UPDATE synthetic_signature_patterns SET error_message = ?1 WHERE pattern = ?2",
                    params![r.error_message, r.pattern],
                )?;
            }
            info!(
                rejected = rejected.len(),
                "marked invalid synthetic signature patterns rejected"
            );
        }
        Ok(())
    }

    /// True when the signature is compiler/framework-generated noise.
    #[must_use]
    pub fn is_synthetic(&self, signature: &str) -> bool {
        self.matcher.is_synthetic(signature)
    }
}
