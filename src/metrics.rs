/// Metrics Module - Prometheus Instrumentation
///
/// Process-wide registry plus helpers for the pipeline, DB writer,
/// broadcaster and pollers. Served as text on /metrics.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Flush latency buckets (seconds)
const FLUSH_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Raw log lines received, per node
    pub static ref LINES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("nodepulse_lines_received_total", "Raw log lines received per node"),
        &["node"]
    ).unwrap();

    /// Lines the parser rejected (malformed, non-JSON payload, too few fields)
    pub static ref PARSE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("nodepulse_parse_errors_total", "Log lines dropped by the parser"),
        &["node"]
    ).unwrap();

    /// Traffic events accepted into the pipeline, per node
    pub static ref EVENTS_INGESTED: IntCounterVec = IntCounterVec::new(
        Opts::new("nodepulse_events_ingested_total", "Parsed traffic events per node"),
        &["node"]
    ).unwrap();

    /// Events dropped because the DB queue was full
    pub static ref EVENTS_DROPPED: IntCounter = IntCounter::new(
        "nodepulse_events_dropped_total",
        "Traffic events dropped on DB queue overflow"
    ).unwrap();

    /// Completed hashstore compactions observed
    pub static ref COMPACTIONS_RECORDED: IntCounter = IntCounter::new(
        "nodepulse_compactions_recorded_total",
        "Hashstore compaction records persisted"
    ).unwrap();

    /// DB batches committed
    pub static ref DB_BATCHES_COMMITTED: IntCounter = IntCounter::new(
        "nodepulse_db_batches_committed_total",
        "Event batches committed by the DB writer"
    ).unwrap();

    /// Rows in the most recent committed batch
    pub static ref DB_BATCH_SIZE: IntGauge = IntGauge::new(
        "nodepulse_db_batch_size",
        "Rows in the most recently committed event batch"
    ).unwrap();

    /// Batch flush latency
    pub static ref DB_FLUSH_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("nodepulse_db_flush_seconds", "Event batch commit latency")
            .buckets(FLUSH_BUCKETS.to_vec())
    ).unwrap();

    /// Busy/locked retries performed by the writer
    pub static ref DB_RETRIES: IntCounter = IntCounter::new(
        "nodepulse_db_retries_total",
        "DB operations retried on busy/locked"
    ).unwrap();

    /// Connected WebSocket clients
    pub static ref WS_CLIENTS: IntGauge = IntGauge::new(
        "nodepulse_ws_clients",
        "Currently connected WebSocket clients"
    ).unwrap();

    /// Broadcast frames delivered / failed
    pub static ref WS_SENDS: IntCounterVec = IntCounterVec::new(
        Opts::new("nodepulse_ws_sends_total", "WebSocket sends by outcome"),
        &["outcome"]
    ).unwrap();

    /// Alerts generated, by severity
    pub static ref ALERTS_GENERATED: IntCounterVec = IntCounterVec::new(
        Opts::new("nodepulse_alerts_generated_total", "Alerts generated by severity"),
        &["severity"]
    ).unwrap();

    /// Node management API poll failures, by endpoint
    pub static ref API_POLL_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("nodepulse_api_poll_errors_total", "Node API poll failures"),
        &["endpoint"]
    ).unwrap();
}

/// Register all metrics with the global registry. Safe to call once at boot.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(LINES_RECEIVED.clone()),
        Box::new(PARSE_ERRORS.clone()),
        Box::new(EVENTS_INGESTED.clone()),
        Box::new(EVENTS_DROPPED.clone()),
        Box::new(COMPACTIONS_RECORDED.clone()),
        Box::new(DB_BATCHES_COMMITTED.clone()),
        Box::new(DB_BATCH_SIZE.clone()),
        Box::new(DB_FLUSH_SECONDS.clone()),
        Box::new(DB_RETRIES.clone()),
        Box::new(WS_CLIENTS.clone()),
        Box::new(WS_SENDS.clone()),
        Box::new(ALERTS_GENERATED.clone()),
        Box::new(API_POLL_ERRORS.clone()),
    ];
    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("metric already registered: {}", e);
        }
    }
}

/// Encode the registry in Prometheus text exposition format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        register_metrics();
        // Registering twice must not panic
        register_metrics();
        LINES_RECEIVED.with_label_values(&["test-node"]).inc();
        let text = gather_text();
        assert!(text.contains("nodepulse_lines_received_total"));
    }
}
