use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Pass Metrics
    // ============================================================================

    /// Pass outcomes by job (completed, suspended, reverted, failed, contended)
    pub static ref PASS_OUTCOMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("regsync_pass_outcomes_total", "Total passes by outcome"),
        &["job", "outcome"]
    ).expect("metric can be created");

    /// Wall-clock duration of a single invocation
    pub static ref PASS_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("regsync_pass_duration_seconds", "Pass duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["job"]
    ).expect("metric can be created");

    /// Checkpoints left behind by suspended passes
    pub static ref OUTSTANDING_CHECKPOINTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("regsync_outstanding_checkpoints", "Partitions with an incomplete pass"),
        &["job"]
    ).expect("metric can be created");

    /// Lock acquisitions that found another holder
    pub static ref LOCK_CONTENDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("regsync_lock_contended_total", "Total contended lock acquisitions"),
        &["job"]
    ).expect("metric can be created");

    // ============================================================================
    // Write Metrics
    // ============================================================================

    /// Aggregate records written to the read store
    pub static ref RECORDS_WRITTEN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("regsync_records_written_total", "Total aggregate records written"),
        &["job", "partition"]
    ).expect("metric can be created");

    /// Records left alone because their content did not change
    pub static ref RECORDS_SKIPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("regsync_records_skipped_total", "Total unchanged records skipped"),
        &["job", "partition"]
    ).expect("metric can be created");

    /// Write batches that failed after exhausting retries
    pub static ref BATCH_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("regsync_batch_failures_total", "Total failed write batches"),
        &["job", "partition"]
    ).expect("metric can be created");

    /// Overflow chunks produced by the chunker
    pub static ref OVERFLOW_CHUNKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("regsync_overflow_chunks_total", "Total overflow chunks written"),
        &["scope"]
    ).expect("metric can be created");

    // ============================================================================
    // Manifest & Alias Metrics
    // ============================================================================

    pub static ref MANIFESTS_MIRRORED_TOTAL: IntCounter = IntCounter::new(
        "regsync_manifests_mirrored_total",
        "Total manifests pushed to the recent mirror"
    ).expect("metric can be created");

    /// Recent ids that could not be located in the source lake
    pub static ref MIRROR_LOOKUP_MISSES_TOTAL: IntCounter = IntCounter::new(
        "regsync_mirror_lookup_misses_total",
        "Total recent records not found in the source"
    ).expect("metric can be created");

    pub static ref ALIAS_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "regsync_alias_cache_hits_total",
        "Total alias cache hits"
    ).expect("metric can be created");

    pub static ref ALIAS_CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "regsync_alias_cache_misses_total",
        "Total alias cache misses"
    ).expect("metric can be created");

    // ============================================================================
    // Queue Metrics
    // ============================================================================

    pub static ref MESSAGES_HANDLED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("regsync_messages_handled_total", "Total work messages handled"),
        &["kind"]
    ).expect("metric can be created");

    /// Payloads that could not be parsed or recovered
    pub static ref BAD_MESSAGES_TOTAL: IntCounter = IntCounter::new(
        "regsync_bad_messages_total",
        "Total unrecoverable work messages"
    ).expect("metric can be created");

    /// Chained hand-offs the successor never acknowledged
    pub static ref HANDOFF_UNVERIFIED_TOTAL: IntCounter = IntCounter::new(
        "regsync_handoff_unverified_total",
        "Total unverified chain hand-offs"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Pass metrics
        REGISTRY
            .register(Box::new(PASS_OUTCOMES_TOTAL.clone()))
            .expect("pass_outcomes_total can be registered");
        REGISTRY
            .register(Box::new(PASS_DURATION.clone()))
            .expect("pass_duration can be registered");
        REGISTRY
            .register(Box::new(OUTSTANDING_CHECKPOINTS.clone()))
            .expect("outstanding_checkpoints can be registered");
        REGISTRY
            .register(Box::new(LOCK_CONTENDED_TOTAL.clone()))
            .expect("lock_contended_total can be registered");

        // Write metrics
        REGISTRY
            .register(Box::new(RECORDS_WRITTEN_TOTAL.clone()))
            .expect("records_written_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_SKIPPED_TOTAL.clone()))
            .expect("records_skipped_total can be registered");
        REGISTRY
            .register(Box::new(BATCH_FAILURES_TOTAL.clone()))
            .expect("batch_failures_total can be registered");
        REGISTRY
            .register(Box::new(OVERFLOW_CHUNKS_TOTAL.clone()))
            .expect("overflow_chunks_total can be registered");

        // Manifest & alias metrics
        REGISTRY
            .register(Box::new(MANIFESTS_MIRRORED_TOTAL.clone()))
            .expect("manifests_mirrored_total can be registered");
        REGISTRY
            .register(Box::new(MIRROR_LOOKUP_MISSES_TOTAL.clone()))
            .expect("mirror_lookup_misses_total can be registered");
        REGISTRY
            .register(Box::new(ALIAS_CACHE_HITS_TOTAL.clone()))
            .expect("alias_cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(ALIAS_CACHE_MISSES_TOTAL.clone()))
            .expect("alias_cache_misses_total can be registered");

        // Queue metrics
        REGISTRY
            .register(Box::new(MESSAGES_HANDLED_TOTAL.clone()))
            .expect("messages_handled_total can be registered");
        REGISTRY
            .register(Box::new(BAD_MESSAGES_TOTAL.clone()))
            .expect("bad_messages_total can be registered");
        REGISTRY
            .register(Box::new(HANDOFF_UNVERIFIED_TOTAL.clone()))
            .expect("handoff_unverified_total can be registered");
    });
}
