//! Prometheus metrics for the scoring pipeline

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Encoder, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    /// Batches handed to a worker
    pub static ref BATCHES_DISPATCHED: IntCounter = register_int_counter!(
        "ml_facade_batches_dispatched_total",
        "Total batches dispatched by the intake loop"
    )
    .unwrap();

    /// Readings per scored batch
    pub static ref BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "ml_facade_batch_size",
        "Readings per scored batch",
        &["origin"],
        vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]
    )
    .unwrap();

    /// Batches that failed scoring
    pub static ref BATCHES_FAILED: IntCounterVec = register_int_counter_vec!(
        "ml_facade_batches_failed_total",
        "Total batches that failed scoring",
        &["origin", "code"]
    )
    .unwrap();

    /// Scorer round-trip duration (retries included)
    pub static ref SCORER_DURATION: Histogram = register_histogram!(
        "ml_facade_scorer_request_duration_seconds",
        "Scorer request duration in seconds",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    /// Scorer calls that failed after retries
    pub static ref SCORER_FAILURES: IntCounterVec = register_int_counter_vec!(
        "ml_facade_scorer_failures_total",
        "Scorer calls that failed",
        &["code"]
    )
    .unwrap();

    /// Anomaly decisions
    pub static ref ANOMALIES: IntCounterVec = register_int_counter_vec!(
        "ml_facade_anomalies_total",
        "Readings classified as anomalous",
        &["origin"]
    )
    .unwrap();

    /// Last adaptive counter value seen per machine. One series per machine id,
    /// so it is only fed when `MetricsConfig::per_machine_counters` is set.
    pub static ref COUNTER_VALUE: IntGaugeVec = register_int_gauge_vec!(
        "ml_facade_anomaly_counter",
        "Last adaptive counter value per machine (one series per machine id)",
        &["machine_id"]
    )
    .unwrap();

    /// Threshold cache lookups
    pub static ref CACHE_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "ml_facade_threshold_cache_lookups_total",
        "Threshold cache lookups by result",
        &["result"]
    )
    .unwrap();

    /// Broker connection attempts
    pub static ref BROKER_CONNECT_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "ml_facade_broker_connect_attempts_total",
        "Broker connection attempts by result",
        &["result"]
    )
    .unwrap();

    /// Broker connection state (0 disconnected, 1 connecting, 2 connected, 3 stopped)
    pub static ref BROKER_STATE: IntGauge = register_int_gauge!(
        "ml_facade_broker_state",
        "Broker connection state"
    )
    .unwrap();

    /// Batches currently being processed
    pub static ref IN_FLIGHT_BATCHES: IntGauge = register_int_gauge!(
        "ml_facade_in_flight_batches",
        "Batches currently being processed"
    )
    .unwrap();
}

/// Render every registered collector in the text exposition format
pub fn export() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
