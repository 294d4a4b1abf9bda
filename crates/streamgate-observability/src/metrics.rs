use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Fan-out Metrics
    // ============================================================================

    /// Fan-outs with an upstream stream open, by direction
    pub static ref FANOUTS_OPEN: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamgate_fanouts_open", "Fan-outs with an open upstream stream"),
        &["direction"]
    ).expect("metric can be created");

    /// Members attached to fan-outs
    pub static ref MEMBERS_ATTACHED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamgate_members_attached", "Member streams attached to fan-outs"),
        &["direction", "topic"]
    ).expect("metric can be created");

    /// Upstream reconnects scheduled after a transient failure
    pub static ref UPSTREAM_RECONNECTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamgate_upstream_reconnects_total", "Total upstream reconnects scheduled"),
        &["direction", "topic"]
    ).expect("metric can be created");

    /// Cache segments removed by retention or compaction
    pub static ref SEGMENTS_REMOVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamgate_segments_removed_total", "Total cache segments removed"),
        &["topic", "reason"]
    ).expect("metric can be created");

    // ============================================================================
    // Fetch Metrics
    // ============================================================================

    /// DATA fragments delivered to consumers
    pub static ref FETCH_FRAGMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamgate_fetch_fragments_total", "Total fragments delivered to consumers"),
        &["topic"]
    ).expect("metric can be created");

    /// Value bytes delivered to consumers
    pub static ref FETCH_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamgate_fetch_bytes_total", "Total value bytes delivered to consumers"),
        &["topic"]
    ).expect("metric can be created");

    // ============================================================================
    // Produce Metrics
    // ============================================================================

    /// Records written into the cache by producers
    pub static ref PRODUCE_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamgate_produce_records_total", "Total records produced"),
        &["topic"]
    ).expect("metric can be created");

    /// Records acknowledged back to producers
    pub static ref PRODUCE_ACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamgate_produce_acks_total", "Total records acknowledged"),
        &["topic"]
    ).expect("metric can be created");

    /// Producer errors by broker error code
    pub static ref PRODUCE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamgate_produce_errors_total", "Total producer errors"),
        &["topic", "error_code"]
    ).expect("metric can be created");

    // ============================================================================
    // Budget Metrics
    // ============================================================================

    /// Budget claims that granted less than requested
    pub static ref BUDGET_CLAIMS_SHORT_TOTAL: IntCounter = IntCounter::new(
        "streamgate_budget_claims_short_total",
        "Total budget claims granted less than requested"
    ).expect("metric can be created");
}

/// Register all metrics with the global registry
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(FANOUTS_OPEN.clone()))
            .expect("fanouts_open can be registered");
        REGISTRY
            .register(Box::new(MEMBERS_ATTACHED.clone()))
            .expect("members_attached can be registered");
        REGISTRY
            .register(Box::new(UPSTREAM_RECONNECTS_TOTAL.clone()))
            .expect("upstream_reconnects_total can be registered");
        REGISTRY
            .register(Box::new(SEGMENTS_REMOVED_TOTAL.clone()))
            .expect("segments_removed_total can be registered");

        REGISTRY
            .register(Box::new(FETCH_FRAGMENTS_TOTAL.clone()))
            .expect("fetch_fragments_total can be registered");
        REGISTRY
            .register(Box::new(FETCH_BYTES_TOTAL.clone()))
            .expect("fetch_bytes_total can be registered");

        REGISTRY
            .register(Box::new(PRODUCE_RECORDS_TOTAL.clone()))
            .expect("produce_records_total can be registered");
        REGISTRY
            .register(Box::new(PRODUCE_ACKS_TOTAL.clone()))
            .expect("produce_acks_total can be registered");
        REGISTRY
            .register(Box::new(PRODUCE_ERRORS_TOTAL.clone()))
            .expect("produce_errors_total can be registered");

        REGISTRY
            .register(Box::new(BUDGET_CLAIMS_SHORT_TOTAL.clone()))
            .expect("budget_claims_short_total can be registered");
    });
}
