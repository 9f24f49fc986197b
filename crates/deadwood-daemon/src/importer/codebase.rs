//! Codebase publication importer.

use std::time::Instant;

use deadwood_core::classify::{
    ClassificationPolicy, InvocationStatus, calculate_initial_status,
};
use deadwood_core::events::DomainEvent;
use deadwood_core::model::{CodeBaseEntry, CodeBasePublication};
use deadwood_core::signature::StoredSignature;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use super::{ImportContext, ImportError};
use crate::dao;
use crate::lock::LockSpec;
use crate::outbox;

/// Imports codebase publications: upserts the structural rows and the
/// initial invocation classification for every non-synthetic entry.
pub struct CodeBaseImporter {
    ctx: ImportContext,
}

impl CodeBaseImporter {
    /// Creates an importer over the shared context.
    #[must_use]
    pub const fn new(ctx: ImportContext) -> Self {
        Self { ctx }
    }

    /// Imports one publication. Returns `true` when the import took effect
    /// (including the fingerprint fast path, which is a successful no-op
    /// for structural data).
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`]; see the module taxonomy for which kinds
    /// are retryable.
    pub fn import_publication(
        &self,
        publication: &CodeBasePublication,
    ) -> Result<bool, ImportError> {
        let correlation_id = Uuid::new_v4();
        let span = info_span!("codebase_import",
            %correlation_id,
            customer_id = publication.common.customer_id,
            app = %publication.common.app_name);
        let _entered = span.enter();
        let started = Instant::now();

        publication.validate()?;
        let common = &publication.common;
        self.ctx.customers.assert_database_size(common.customer_id)?;

        self.ctx.filter.refresh()?;
        let (entries, ignored): (Vec<&CodeBaseEntry>, Vec<&CodeBaseEntry>) = publication
            .entries
            .iter()
            .partition(|e| !self.ctx.filter.is_synthetic(&e.signature));
        self.ctx
            .metrics
            .record_ignored_synthetics("codebase", ignored.len());

        let policy = ClassificationPolicy {
            excluded_packages: common.excluded_packages.clone(),
            min_visibility: Some(common.method_visibility),
        };
        let environment = self.ctx.resolve_environment(&common.environment).to_string();

        // The whole business write runs under the customer lock; a timeout
        // surfaces as a retryable error because there is no partial
        // fallback for half a publication.
        let mut customer_lock = self
            .ctx
            .locks
            .acquire_or_fail(&LockSpec::Customer(common.customer_id), self.ctx.lock_wait)?;

        let fingerprint_match;
        {
            let mut conn = self.ctx.db.lock();
            let tx = conn.transaction()?;

            let application_id = dao::upsert_application(
                &tx,
                common.customer_id,
                &common.app_name,
                common.jvm_started_at_millis,
            )?;
            let environment_id = dao::upsert_environment(
                &tx,
                common.customer_id,
                &environment,
                common.published_at_millis,
            )?;
            dao::upsert_jvm(&tx, common, application_id, environment_id)?;

            fingerprint_match = dao::fingerprint_exists(
                &tx,
                common.customer_id,
                application_id,
                &common.code_base_fingerprint,
            )?;
            if fingerprint_match {
                debug!(fingerprint = %common.code_base_fingerprint,
                       "fingerprint already imported; skipping structural upserts");
            }

            for entry in &entries {
                self.import_entry(
                    &tx,
                    common.customer_id,
                    application_id,
                    environment_id,
                    entry,
                    &policy,
                    fingerprint_match,
                    common.published_at_millis,
                )?;
            }

            dao::record_fingerprint(
                &tx,
                common.customer_id,
                application_id,
                &common.code_base_fingerprint,
                common.published_at_millis,
            )?;

            outbox::publish_in_tx(
                &tx,
                &DomainEvent::CodeBaseImported {
                    customer_id: common.customer_id,
                    app_name: common.app_name.clone(),
                    environment: environment.clone(),
                    jvm_uuid: common.jvm_uuid,
                    code_base_fingerprint: common.code_base_fingerprint.clone(),
                    method_count: entries.len(),
                    ignored_synthetic_count: ignored.len(),
                    fingerprint_match,
                },
                Some(correlation_id),
            )?;

            tx.commit()?;
        }
        customer_lock.release()?;

        let elapsed = started.elapsed().as_secs_f64();
        self.ctx.metrics.record_import("codebase", "imported", elapsed);
        info!(
            methods = entries.len(),
            ignored_synthetic = ignored.len(),
            fingerprint_match,
            elapsed_secs = elapsed,
            "codebase publication imported"
        );
        Ok(true)
    }

    /// One entry: method + location upserts (skipped on a fingerprint
    /// match) and the initial invocation classification. Invocation-status
    /// work always runs; a fingerprint match does not prove every entry
    /// was individually processed by the first import.
    #[allow(clippy::too_many_arguments)]
    fn import_entry(
        &self,
        conn: &rusqlite::Connection,
        customer_id: i64,
        application_id: i64,
        environment_id: i64,
        entry: &CodeBaseEntry,
        policy: &ClassificationPolicy,
        fingerprint_match: bool,
        created_at_millis: i64,
    ) -> Result<(), ImportError> {
        let stored = StoredSignature::from_raw(&entry.signature);
        if stored.is_truncated() {
            dao::record_truncated_signature(conn, customer_id, &stored)?;
        }

        let method_id = if fingerprint_match {
            // Fast path: reuse the row when it exists, upsert when the
            // first import was cut short before reaching this entry.
            match dao::find_method(conn, customer_id, &stored.stored)? {
                Some(m) if m.complete => m.id,
                _ => dao::upsert_method(conn, customer_id, entry, &stored, created_at_millis)?,
            }
        } else {
            let id = dao::upsert_method(conn, customer_id, entry, &stored, created_at_millis)?;
            if let Some(location) = entry.location.as_deref() {
                dao::insert_method_location(conn, customer_id, id, location)?;
            }
            id
        };

        let key = dao::InvocationKey {
            customer_id,
            application_id,
            environment_id,
            method_id,
        };
        let initial = calculate_initial_status(entry, policy);
        let inserted = dao::insert_initial_invocation(conn, key, initial)?;
        if !inserted
            && dao::invocation_status(conn, key)? == Some(InvocationStatus::NotFoundInCodeBase)
        {
            // The method was first seen through an invocation; now that the
            // codebase supplies its structure, re-evaluate.
            dao::reclassify_invocation(conn, key, initial)?;
        }
        Ok(())
    }
}
