//! Invocation data importer.

use std::time::Instant;

use deadwood_core::classify::InvocationStatus;
use deadwood_core::events::DomainEvent;
use deadwood_core::model::InvocationDataPublication;
use deadwood_core::signature::StoredSignature;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use super::{ImportContext, ImportError};
use crate::dao;
use crate::lock::LockSpec;
use crate::outbox;

/// Imports invocation publications: execution evidence for signatures the
/// agent recorded during one interval.
pub struct InvocationDataImporter {
    ctx: ImportContext,
}

impl InvocationDataImporter {
    /// Creates an importer over the shared context.
    #[must_use]
    pub const fn new(ctx: ImportContext) -> Self {
        Self { ctx }
    }

    /// Imports one publication. Replays and out-of-order redeliveries are
    /// absorbed by the `max(invoked_at_millis)` upsert.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`]; see the module taxonomy for which kinds
    /// are retryable.
    pub fn import_publication(
        &self,
        publication: &InvocationDataPublication,
    ) -> Result<bool, ImportError> {
        let correlation_id = Uuid::new_v4();
        let span = info_span!("invocation_import",
            %correlation_id,
            customer_id = publication.common.customer_id,
            app = %publication.common.app_name);
        let _entered = span.enter();
        let started = Instant::now();

        publication.validate()?;
        let common = &publication.common;
        self.ctx.customers.assert_database_size(common.customer_id)?;

        self.ctx.filter.refresh()?;
        let (invocations, ignored): (Vec<&String>, Vec<&String>) = publication
            .invocations
            .iter()
            .partition(|s| !self.ctx.filter.is_synthetic(s));
        self.ctx
            .metrics
            .record_ignored_synthetics("invocations", ignored.len());

        let environment = self.ctx.resolve_environment(&common.environment).to_string();
        let invoked_at = publication.recording_interval_started_at_millis;

        let mut customer_lock = self
            .ctx
            .locks
            .acquire_or_fail(&LockSpec::Customer(common.customer_id), self.ctx.lock_wait)?;

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

            for signature in &invocations {
                let stored = StoredSignature::from_raw(signature);
                if stored.is_truncated() {
                    dao::record_truncated_signature(&tx, common.customer_id, &stored)?;
                }

                let method_id = match dao::find_method(&tx, common.customer_id, &stored.stored)? {
                    Some(method) => method.id,
                    None => {
                        // No codebase publication has supplied this method
                        // yet: incomplete row, classified not-found until a
                        // scan upgrades it.
                        debug!(signature = %stored.stored,
                               "invocation for method not yet in any codebase");
                        let id = dao::insert_incomplete_method(
                            &tx,
                            common.customer_id,
                            &stored.stored,
                            invoked_at,
                        )?;
                        dao::insert_initial_invocation(
                            &tx,
                            dao::InvocationKey {
                                customer_id: common.customer_id,
                                application_id,
                                environment_id,
                                method_id: id,
                            },
                            InvocationStatus::NotFoundInCodeBase,
                        )?;
                        id
                    }
                };

                dao::upsert_invoked(
                    &tx,
                    dao::InvocationKey {
                        customer_id: common.customer_id,
                        application_id,
                        environment_id,
                        method_id,
                    },
                    invoked_at,
                )?;
            }

            outbox::publish_in_tx(
                &tx,
                &DomainEvent::InvocationDataImported {
                    customer_id: common.customer_id,
                    app_name: common.app_name.clone(),
                    environment: environment.clone(),
                    jvm_uuid: common.jvm_uuid,
                    invocation_count: invocations.len(),
                    ignored_synthetic_count: ignored.len(),
                    recording_interval_started_at_millis: invoked_at,
                },
                Some(correlation_id),
            )?;

            tx.commit()?;
        }
        customer_lock.release()?;

        let elapsed = started.elapsed().as_secs_f64();
        self.ctx
            .metrics
            .record_import("invocations", "imported", elapsed);
        info!(
            invocations = invocations.len(),
            ignored_synthetic = ignored.len(),
            elapsed_secs = elapsed,
            "invocation publication imported"
        );
        Ok(true)
    }
}
