//! Publication import and consistency engine.
//!
//! Turns an at-least-once stream of agent publication files into correct,
//! idempotent SQLite state: exactly-once effects per publication, safe
//! concurrent writers per customer (serialized by named locks), and a
//! transactional event outbox consumed at-least-once with a dedup ledger.
//!
//! # Layers
//!
//! - [`db`]: the shared SQLite handle and schema.
//! - [`lock`], [`outbox`], [`dedup`]: coordination primitives, all backed
//!   by the same database so they are transactional with business writes.
//! - [`dao`]: hand-written upserts with the monotonicity rules in SQL.
//! - [`importer`]: per-publication orchestration and the retry/fatal
//!   taxonomy.
//! - [`weeding`]: background reclamation of rows past retention.

pub mod customer;
pub mod dao;
pub mod db;
pub mod dedup;
pub mod importer;
pub mod lock;
pub mod metrics;
pub mod outbox;
pub mod patterns;
pub mod weeding;

pub use customer::{CustomerDirectory, SqliteCustomerDirectory};
pub use db::Database;
pub use dedup::{DedupError, MessageIdLedger};
pub use importer::{
    CodeBaseImporter, ImportContext, ImportError, InvocationDataImporter, PublicationFileImporter,
};
pub use lock::{LockGuard, LockManager, LockSpec};
pub use metrics::ImportMetrics;
pub use outbox::{EventReceiver, QueuedEvent, publish_in_tx};
pub use patterns::SyntheticFilterService;
pub use weeding::{WeedingReport, WeedingTask};
