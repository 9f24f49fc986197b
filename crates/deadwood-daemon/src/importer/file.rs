//! Publication file importer: per-file locking, dispatch, and outcome
//! classification.

use std::path::Path;

use deadwood_core::model::PublicationFile;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use super::{CodeBaseImporter, ImportContext, ImportError, InvocationDataImporter};
use crate::lock::LockSpec;

/// Imports uploaded publication files from disk.
///
/// The boolean contract toward the transport is deliberately coarse:
/// `true` means "stop sending this file" (imported, or permanently
/// unrecoverable and dropped), `false` means "keep it, try again later".
/// The agent never learns the difference between success and permanent
/// skip, only whether to resend.
pub struct PublicationFileImporter {
    ctx: ImportContext,
    codebase: CodeBaseImporter,
    invocations: InvocationDataImporter,
}

impl PublicationFileImporter {
    /// Creates the importer and its two payload importers.
    #[must_use]
    pub fn new(ctx: ImportContext) -> Self {
        Self {
            codebase: CodeBaseImporter::new(ctx.clone()),
            invocations: InvocationDataImporter::new(ctx.clone()),
            ctx,
        }
    }

    /// Imports one file. Returns `true` when the file is handled and must
    /// not be offered again.
    ///
    /// Never panics and never throws for expected conditions: every
    /// failure is folded into the handled/not-handled signal here. The
    /// correlation span is scoped to this call, so logging context is
    /// cleared on every exit path.
    pub fn import_file(&self, path: &Path) -> bool {
        let file_name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let correlation_id = Uuid::new_v4();
        let span = info_span!("publication_file", %correlation_id, file = %file_name);
        let _entered = span.enter();

        // One file is never processed twice concurrently.
        let file_lock = match self
            .ctx
            .locks
            .try_acquire(&LockSpec::Publication(file_name.clone()))
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("file is being processed elsewhere; leaving it for a later pass");
                return false;
            }
            Err(e) => {
                error!(error = %e, "lock layer failure before touching the file");
                return false;
            }
        };

        let handled = match self.try_import(path) {
            Ok(_) => true,
            Err(e) if e.is_unrecoverable() => {
                // Old schema, malformed content, or a policy violation:
                // retrying cannot change the outcome. The agent resumes
                // publishing fresh data on its own.
                warn!(error = %e, "publication permanently rejected");
                self.ctx.metrics.record_import(
                    "file",
                    "rejected",
                    0.0,
                );
                true
            }
            Err(e) if e.is_retryable() => {
                info!(error = %e, "transient failure; file left for a later pass");
                self.ctx.metrics.record_import("file", "retry", 0.0);
                false
            }
            Err(e) => {
                // Unknown bucket: assume transient, but loudly.
                error!(error = %e, "publication import failed; file left for a later pass");
                self.ctx.metrics.record_import("file", "error", 0.0);
                false
            }
        };

        drop(file_lock);
        handled
    }

    fn try_import(&self, path: &Path) -> Result<bool, ImportError> {
        let publication = PublicationFile::from_path(path)?;
        publication.validate()?;
        match publication {
            PublicationFile::CodeBaseV2(p) => self.codebase.import_publication(&p),
            PublicationFile::InvocationsV2(p) => self.invocations.import_publication(&p),
        }
    }
}
