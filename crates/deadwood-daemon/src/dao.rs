//! Import data access layer.
//!
//! Hand-written upserts for every table the importers touch. All functions
//! take a borrowed connection so the importer can run one publication as a
//! single transaction under the customer lock; nothing here opens its own.
//!
//! Monotonicity rules live in the SQL itself where concurrent writers could
//! race them: `created_at_millis` only moves earlier (`min(...)`),
//! `published_at_millis` only forward (`max(...)`), and the invoked upsert
//! is one atomic `ON CONFLICT` statement, never read-then-write. The one
//! read-then-decide path, [`reclassify_invocation`], runs only under the
//! customer lock and is where the forward-only transition invariant is
//! checked explicitly.

use deadwood_core::classify::InvocationStatus;
use deadwood_core::model::{CodeBaseEntry, CommonPublicationData};
use deadwood_core::signature::StoredSignature;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::db::now_millis;

/// Errors raised by DAO operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DaoError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored status label is corrupt or from a newer schema.
    #[error(transparent)]
    Classify(#[from] deadwood_core::classify::ClassifyError),

    /// A row that must exist at this point does not.
    #[error("method {method_id} vanished mid-import")]
    MethodVanished {
        /// The missing method row id.
        method_id: i64,
    },
}

/// Key of one invocation row.
#[derive(Debug, Clone, Copy)]
pub struct InvocationKey {
    pub customer_id: i64,
    pub application_id: i64,
    pub environment_id: i64,
    pub method_id: i64,
}

/// A method row as the importers see it.
#[derive(Debug, Clone)]
pub struct MethodRef {
    /// Row id.
    pub id: i64,

    /// False while only the signature is known.
    pub complete: bool,
}

/// Upserts an application and returns its id.
///
/// `first_seen_millis` is the JVM start time from the publication;
/// `created_at_millis` only ever moves earlier.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn upsert_application(
    conn: &Connection,
    customer_id: i64,
    name: &str,
    first_seen_millis: i64,
) -> Result<i64, DaoError> {
    conn.execute(
        "INSERT INTO applications (customer_id, name, created_at_millis)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(customer_id, name) DO UPDATE SET
           created_at_millis = min(created_at_millis, excluded.created_at_millis)",
        params![customer_id, name, first_seen_millis],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM applications WHERE customer_id = ?1 AND name = ?2",
        params![customer_id, name],
        |row| row.get(0),
    )?)
}

/// Upserts an environment and returns its id. The caller resolves the
/// default name for empty agent-reported environments; `enabled` is never
/// written here.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn upsert_environment(
    conn: &Connection,
    customer_id: i64,
    name: &str,
    created_at_millis: i64,
) -> Result<i64, DaoError> {
    conn.execute(
        "INSERT INTO environments (customer_id, name, created_at_millis)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(customer_id, name) DO NOTHING",
        params![customer_id, name, created_at_millis],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM environments WHERE customer_id = ?1 AND name = ?2",
        params![customer_id, name],
        |row| row.get(0),
    )?)
}

/// Upserts the JVM row for this agent instance.
///
/// Runs on every publication from the JVM; `published_at_millis` moves
/// forward monotonically and a redelivered older publication never drags it
/// back. Re-publication also clears the garbage mark a weeding pass may
/// have set.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn upsert_jvm(
    conn: &Connection,
    common: &CommonPublicationData,
    application_id: i64,
    environment_id: i64,
) -> Result<i64, DaoError> {
    conn.execute(
        "INSERT INTO jvms (customer_id, application_id, environment_id, uuid,
                           code_base_fingerprint, started_at_millis, published_at_millis,
                           method_visibility, packages, excluded_packages,
                           agent_version, hostname, tags, garbage)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0)
         ON CONFLICT(customer_id, uuid) DO UPDATE SET
           application_id = excluded.application_id,
           environment_id = excluded.environment_id,
           code_base_fingerprint = excluded.code_base_fingerprint,
           published_at_millis = max(published_at_millis, excluded.published_at_millis),
           method_visibility = excluded.method_visibility,
           packages = excluded.packages,
           excluded_packages = excluded.excluded_packages,
           agent_version = excluded.agent_version,
           hostname = excluded.hostname,
           tags = excluded.tags,
           garbage = 0",
        params![
            common.customer_id,
            application_id,
            environment_id,
            common.jvm_uuid.to_string(),
            common.code_base_fingerprint,
            common.jvm_started_at_millis,
            common.published_at_millis,
            common.method_visibility.as_str(),
            common.packages.join(","),
            common.excluded_packages.join(","),
            common.agent_version,
            common.hostname,
            common.tags,
        ],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM jvms WHERE customer_id = ?1 AND uuid = ?2",
        params![common.customer_id, common.jvm_uuid.to_string()],
        |row| row.get(0),
    )?)
}

/// Looks up a method by its stored signature.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn find_method(
    conn: &Connection,
    customer_id: i64,
    stored_signature: &str,
) -> Result<Option<MethodRef>, DaoError> {
    Ok(conn
        .query_row(
            "SELECT id, complete FROM methods WHERE customer_id = ?1 AND signature = ?2",
            params![customer_id, stored_signature],
            |row| {
                Ok(MethodRef {
                    id: row.get(0)?,
                    complete: row.get::<_, i64>(1)? != 0,
                })
            },
        )
        .optional()?)
}

/// Upserts a complete method from a codebase entry and returns its id.
///
/// An incomplete row left behind by an earlier invocation publication is
/// upgraded in place; `created_at_millis` only moves earlier.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn upsert_method(
    conn: &Connection,
    customer_id: i64,
    entry: &CodeBaseEntry,
    stored: &StoredSignature,
    created_at_millis: i64,
) -> Result<i64, DaoError> {
    conn.execute(
        "INSERT INTO methods (customer_id, signature, method_name, visibility,
                              declaring_type, package_name, parameter_count,
                              modifiers, bridge, synthetic, complete, created_at_millis)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)
         ON CONFLICT(customer_id, signature) DO UPDATE SET
           method_name = excluded.method_name,
           visibility = excluded.visibility,
           declaring_type = excluded.declaring_type,
           package_name = excluded.package_name,
           parameter_count = excluded.parameter_count,
           modifiers = excluded.modifiers,
           bridge = excluded.bridge,
           synthetic = excluded.synthetic,
           complete = 1,
           created_at_millis = min(created_at_millis, excluded.created_at_millis)",
        params![
            customer_id,
            stored.stored,
            entry.method_name,
            entry.visibility.as_str(),
            entry.declaring_type,
            entry.package_name,
            entry.parameter_count,
            entry.modifiers,
            entry.bridge,
            entry.synthetic,
            created_at_millis,
        ],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM methods WHERE customer_id = ?1 AND signature = ?2",
        params![customer_id, stored.stored],
        |row| row.get(0),
    )?)
}

/// Inserts an incomplete method (signature only) and returns its id.
///
/// Used when an invocation references a signature no codebase publication
/// has supplied; visibility stays empty until the upgrade.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn insert_incomplete_method(
    conn: &Connection,
    customer_id: i64,
    stored_signature: &str,
    created_at_millis: i64,
) -> Result<i64, DaoError> {
    conn.execute(
        "INSERT INTO methods (customer_id, signature, complete, created_at_millis)
         VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(customer_id, signature) DO NOTHING",
        params![customer_id, stored_signature, created_at_millis],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM methods WHERE customer_id = ?1 AND signature = ?2",
        params![customer_id, stored_signature],
        |row| row.get(0),
    )?)
}

/// Attaches a source location to a method, at most once per method.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn insert_method_location(
    conn: &Connection,
    customer_id: i64,
    method_id: i64,
    location: &str,
) -> Result<(), DaoError> {
    conn.execute(
        "INSERT INTO method_locations (customer_id, method_id, location)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(customer_id, method_id) DO NOTHING",
        params![customer_id, method_id, location],
    )?;
    Ok(())
}

/// Records an oversized signature in the operator-visibility ledger.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn record_truncated_signature(
    conn: &Connection,
    customer_id: i64,
    stored: &StoredSignature,
) -> Result<(), DaoError> {
    let Some(original) = stored.original.as_deref() else {
        return Ok(());
    };
    conn.execute(
        "INSERT INTO truncated_signatures (customer_id, truncated_signature,
                                           original_signature, original_length,
                                           recorded_at_millis)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(customer_id, original_signature) DO NOTHING",
        params![
            customer_id,
            stored.stored,
            original,
            original.len() as i64,
            now_millis()
        ],
    )?;
    Ok(())
}

/// True when this fingerprint has already been imported for the
/// application.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn fingerprint_exists(
    conn: &Connection,
    customer_id: i64,
    application_id: i64,
    fingerprint: &str,
) -> Result<bool, DaoError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM codebase_fingerprints
             WHERE customer_id = ?1 AND application_id = ?2 AND code_base_fingerprint = ?3",
            params![customer_id, application_id, fingerprint],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Records an imported fingerprint; idempotent.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn record_fingerprint(
    conn: &Connection,
    customer_id: i64,
    application_id: i64,
    fingerprint: &str,
    published_at_millis: i64,
) -> Result<(), DaoError> {
    conn.execute(
        "INSERT INTO codebase_fingerprints (customer_id, application_id,
                                            code_base_fingerprint, published_at_millis)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(customer_id, application_id, code_base_fingerprint) DO NOTHING",
        params![customer_id, application_id, fingerprint, published_at_millis],
    )?;
    Ok(())
}

/// Inserts an invocation row if the key has none yet. Returns true on
/// insert. Existing rows are untouched; re-evaluation of
/// `NOT_FOUND_IN_CODE_BASE` rows goes through [`reclassify_invocation`].
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn insert_initial_invocation(
    conn: &Connection,
    key: InvocationKey,
    status: InvocationStatus,
) -> Result<bool, DaoError> {
    let inserted = conn.execute(
        "INSERT INTO invocations (customer_id, application_id, environment_id,
                                  method_id, status, invoked_at_millis)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)
         ON CONFLICT(customer_id, application_id, environment_id, method_id) DO NOTHING",
        params![
            key.customer_id,
            key.application_id,
            key.environment_id,
            key.method_id,
            status.as_str(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Current status of an invocation row.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure and [`DaoError::Classify`]
/// for a corrupt stored label.
pub fn invocation_status(
    conn: &Connection,
    key: InvocationKey,
) -> Result<Option<InvocationStatus>, DaoError> {
    let label: Option<String> = conn
        .query_row(
            "SELECT status FROM invocations
             WHERE customer_id = ?1 AND application_id = ?2
               AND environment_id = ?3 AND method_id = ?4",
            params![
                key.customer_id,
                key.application_id,
                key.environment_id,
                key.method_id
            ],
            |row| row.get(0),
        )
        .optional()?;
    label.map(|l| InvocationStatus::parse(&l)).transpose().map_err(Into::into)
}

/// Moves an invocation row to a new status, enforcing the forward-only
/// transition contract. Safe only under the customer lock.
///
/// # Errors
///
/// Returns [`DaoError::Classify`] with an illegal-transition kind when the
/// move would go backwards, and [`DaoError::Database`] on failure.
pub fn reclassify_invocation(
    conn: &Connection,
    key: InvocationKey,
    to: InvocationStatus,
) -> Result<(), DaoError> {
    let Some(current) = invocation_status(conn, key)? else {
        return Err(DaoError::MethodVanished {
            method_id: key.method_id,
        });
    };
    let next = current.transition_to(to)?;
    conn.execute(
        "UPDATE invocations SET status = ?5
         WHERE customer_id = ?1 AND application_id = ?2
           AND environment_id = ?3 AND method_id = ?4",
        params![
            key.customer_id,
            key.application_id,
            key.environment_id,
            key.method_id,
            next.as_str(),
        ],
    )?;
    Ok(())
}

/// Records execution evidence: one atomic insert-or-update that moves the
/// row to `INVOKED` and takes the max timestamp. Correct under concurrent
/// writers for the same application/environment from different JVMs, and
/// idempotent under out-of-order redelivery.
///
/// # Errors
///
/// Returns [`DaoError::Database`] on failure.
pub fn upsert_invoked(
    conn: &Connection,
    key: InvocationKey,
    invoked_at_millis: i64,
) -> Result<(), DaoError> {
    conn.execute(
        "INSERT INTO invocations (customer_id, application_id, environment_id,
                                  method_id, status, invoked_at_millis)
         VALUES (?1, ?2, ?3, ?4, 'INVOKED', ?5)
         ON CONFLICT(customer_id, application_id, environment_id, method_id) DO UPDATE SET
           invoked_at_millis = max(invoked_at_millis, excluded.invoked_at_millis),
           status = 'INVOKED'",
        params![
            key.customer_id,
            key.application_id,
            key.environment_id,
            key.method_id,
            invoked_at_millis,
        ],
    )?;
    Ok(())
}
