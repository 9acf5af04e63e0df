//! regsync Observability
//!
//! Prometheus metrics for the aggregation engine. Logging is plain `tracing`
//! and configured by the worker binary.
//!
//! # Usage
//!
//! ```no_run
//! use regsync_observability::{exporter, metrics};
//!
//! metrics::init();
//! metrics::RECORDS_WRITTEN_TOTAL.with_label_values(&["sync", "TX"]).inc_by(25);
//! let text = exporter::render().unwrap();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
