use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref FANOUT_REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_fanout_requests_total",
        "Total fan-out queries issued across partitions"
    ))
    .unwrap();
    pub static ref PARTITION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_partition_failures_total",
        "Total partition calls that failed or returned an error status"
    ))
    .unwrap();
    pub static ref FANOUT_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_fanout_latency_seconds",
            "Time taken to query and merge every partition"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();
    pub static ref EVENTS_FORWARDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_events_forwarded_total",
        "Total event batches forwarded to their owning partition"
    ))
    .unwrap();
    pub static ref REPORTS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_reports_published_total",
        "Total report runs published"
    ))
    .unwrap();
    pub static ref REPORT_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_report_failures_total",
        "Total report runs that failed to collect or publish"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(FANOUT_REQUESTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PARTITION_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FANOUT_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(EVENTS_FORWARDED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(REPORTS_PUBLISHED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(REPORT_FAILURES_TOTAL.clone()))
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
