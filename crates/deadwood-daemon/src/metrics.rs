//! Prometheus metrics for import observability.
//!
//! One registry per daemon; importers record per-publication-type counts
//! and durations, the weeding task records reclaimed rows, and the
//! scheduler exports the outbox depth.

use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Import duration buckets in seconds.
const IMPORT_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Errors raised by metrics setup and export.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Failed to register a metric.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Failed to encode the text exposition.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Import pipeline metrics.
#[derive(Clone)]
pub struct ImportMetrics {
    registry: Arc<Registry>,
    imports_total: IntCounterVec,
    ignored_synthetics_total: IntCounterVec,
    import_duration_seconds: HistogramVec,
    weeded_rows_total: IntCounterVec,
    outbox_depth: IntGauge,
}

impl ImportMetrics {
    /// Creates the metrics family on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] when a metric cannot be
    /// registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Arc::new(Registry::new());

        let imports_total = IntCounterVec::new(
            Opts::new("deadwood_imports_total", "Publication imports by outcome"),
            &["publication", "outcome"],
        )?;
        let ignored_synthetics_total = IntCounterVec::new(
            Opts::new(
                "deadwood_ignored_synthetics_total",
                "Signatures dropped by the synthetic filter",
            ),
            &["publication"],
        )?;
        let import_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "deadwood_import_duration_seconds",
                "Wall time per publication import",
            )
            .buckets(IMPORT_DURATION_BUCKETS.to_vec()),
            &["publication"],
        )?;
        let weeded_rows_total = IntCounterVec::new(
            Opts::new("deadwood_weeded_rows_total", "Rows reclaimed by weeding"),
            &["table"],
        )?;
        let outbox_depth = IntGauge::new(
            "deadwood_outbox_depth",
            "Events waiting in the internal event queue",
        )?;

        registry.register(Box::new(imports_total.clone()))?;
        registry.register(Box::new(ignored_synthetics_total.clone()))?;
        registry.register(Box::new(import_duration_seconds.clone()))?;
        registry.register(Box::new(weeded_rows_total.clone()))?;
        registry.register(Box::new(outbox_depth.clone()))?;

        Ok(Self {
            registry,
            imports_total,
            ignored_synthetics_total,
            import_duration_seconds,
            weeded_rows_total,
            outbox_depth,
        })
    }

    /// Records a finished import attempt.
    pub fn record_import(&self, publication: &str, outcome: &str, duration_secs: f64) {
        self.imports_total
            .with_label_values(&[publication, outcome])
            .inc();
        self.import_duration_seconds
            .with_label_values(&[publication])
            .observe(duration_secs);
    }

    /// Records signatures the synthetic filter dropped.
    pub fn record_ignored_synthetics(&self, publication: &str, count: usize) {
        if count > 0 {
            self.ignored_synthetics_total
                .with_label_values(&[publication])
                .inc_by(count as u64);
        }
    }

    /// Records rows the weeding task deleted from one table.
    pub fn record_weeded(&self, table: &str, count: usize) {
        if count > 0 {
            self.weeded_rows_total
                .with_label_values(&[table])
                .inc_by(count as u64);
        }
    }

    /// Updates the outbox depth gauge.
    pub fn set_outbox_depth(&self, depth: i64) {
        self.outbox_depth.set(depth);
    }

    /// Text exposition for scraping.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Encoding`] when encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
