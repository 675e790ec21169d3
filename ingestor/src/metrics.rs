use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref BATCHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_batches_total",
        "Total event batches received"
    ))
    .unwrap();
    pub static ref EVENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_events_total",
        "Total events committed to in-progress series"
    ))
    .unwrap();
    pub static ref INVALID_BATCHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_batches_total",
        "Total batches rejected by validation"
    ))
    .unwrap();
    pub static ref MESSAGES_COMPLETED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_completed_total",
        "Total completed messages archived to history"
    ))
    .unwrap();
    pub static ref HISTORY_KEY_COLLISIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_history_key_collisions_total",
        "Total occupied history slots probed past"
    ))
    .unwrap();
    pub static ref COMMIT_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_commit_retries_total",
        "Total transaction attempts retried after a store timeout"
    ))
    .unwrap();
    pub static ref COMMIT_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_commit_failures_total",
        "Total transactions abandoned after exhausting retries"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to commit one event batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(BATCHES_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(EVENTS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(INVALID_BATCHES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MESSAGES_COMPLETED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(HISTORY_KEY_COLLISIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMIT_RETRIES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMIT_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
