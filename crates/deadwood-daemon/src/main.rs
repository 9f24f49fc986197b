//! deadwoodd: the deadwood import daemon.
//!
//! Three schedule-driven loops over one SQLite database: the intake sweep
//! feeds uploaded publication files to the importer (handled files are
//! deleted, unhandled ones stay for the next pass), the receiver drains the
//! event outbox with dedup-guarded consumption, and the weeding task
//! reclaims rows past retention. Request-style work (one file at a time)
//! and the background loops coordinate only through the database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use deadwood_core::config::DaemonConfig;
use deadwood_daemon::{
    Database, EventReceiver, ImportContext, ImportMetrics, LockManager, MessageIdLedger,
    PublicationFileImporter, SqliteCustomerDirectory, SyntheticFilterService, WeedingTask,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "deadwoodd", about = "deadwood publication import daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/deadwood/deadwoodd.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = DaemonConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    std::fs::create_dir_all(&config.intake_dir)
        .with_context(|| format!("creating intake dir {}", config.intake_dir.display()))?;
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;

    let locks = LockManager::new(db.clone(), config.lock_ttl());
    let metrics = ImportMetrics::new().context("registering metrics")?;
    let ctx = ImportContext {
        db: db.clone(),
        locks: locks.clone(),
        filter: Arc::new(SyntheticFilterService::new(db.clone())),
        customers: Arc::new(SqliteCustomerDirectory::new(db.clone())),
        metrics: metrics.clone(),
        default_environment: config.default_environment.clone(),
        lock_wait: config.lock_wait(),
    };
    let importer = Arc::new(PublicationFileImporter::new(ctx.clone()));
    let receiver = EventReceiver::new(db.clone(), locks.clone(), config.receiver_batch_size);
    let dedup = MessageIdLedger::new(db.clone());
    let weeding = Arc::new(WeedingTask::new(
        db,
        locks,
        ctx.customers.clone(),
        metrics.clone(),
        config.retention_millis(),
    ));

    info!(intake = %config.intake_dir.display(), "deadwoodd starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async {
        let mut sweep = tokio::time::interval(Duration::from_secs(config.intake_sweep_seconds));
        let mut poll = tokio::time::interval(Duration::from_secs(config.receiver_poll_seconds));
        let mut weed = tokio::time::interval(Duration::from_secs(config.weeding_interval_seconds));

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let importer = importer.clone();
                    let intake_dir = config.intake_dir.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || {
                        sweep_intake(&importer, &intake_dir);
                    })
                    .await
                    {
                        error!(error = %e, "intake sweep panicked");
                    }
                }
                _ = poll.tick() => {
                    drain_outbox(&receiver, &dedup, &metrics);
                }
                _ = weed.tick() => {
                    let weeding = weeding.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || {
                        if let Err(e) = weeding.run() {
                            error!(error = %e, "weeding pass failed");
                        }
                    })
                    .await
                    {
                        error!(error = %e, "weeding pass panicked");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
    });

    Ok(())
}

/// Offers every file in the intake directory to the importer; handled
/// files are deleted, unhandled ones stay for the next sweep.
fn sweep_intake(importer: &PublicationFileImporter, intake_dir: &Path) {
    let entries = match std::fs::read_dir(intake_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, dir = %intake_dir.display(), "cannot read intake dir");
            return;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if importer.import_file(&path) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e,
                      "handled file could not be deleted; it will be re-offered");
            }
        }
    }
}

/// Drains one receiver batch, skipping events the dedup ledger has seen.
fn drain_outbox(receiver: &EventReceiver, dedup: &MessageIdLedger, metrics: &ImportMetrics) {
    let batch = match receiver.poll() {
        Ok(batch) => batch,
        Err(e) => {
            error!(error = %e, "outbox poll failed");
            return;
        }
    };
    if batch.is_empty() {
        if let Ok(depth) = receiver.depth() {
            metrics.set_outbox_depth(depth);
        }
        return;
    }

    for queued in &batch {
        // At-least-once delivery: a replayed row after a crashed ack is
        // discarded here instead of reaching consumers twice.
        let message_id = format!("{}:{}", queued.id, queued.correlation_id);
        match dedup.remember(&message_id) {
            Ok(()) => {
                info!(event = queued.event.type_tag(),
                      correlation_id = %queued.correlation_id,
                      "event delivered");
            }
            Err(deadwood_daemon::DedupError::Duplicate { .. }) => {
                info!(event = queued.event.type_tag(), "duplicate event discarded");
            }
            Err(e) => {
                error!(error = %e, "dedup ledger failure; leaving batch unacknowledged");
                return;
            }
        }
    }

    if let Err(e) = receiver.acknowledge(&batch) {
        error!(error = %e, "acknowledge failed; batch will be redelivered");
    }
    if let Ok(depth) = receiver.depth() {
        metrics.set_outbox_depth(depth);
    }
}
