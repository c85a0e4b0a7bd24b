use crate::errors::{Error, Result};
use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MEASUREMENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_measurements_total",
        "Total measurement deliveries received from the broker"
    ))
    .unwrap();
    pub static ref HEARTBEATS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_heartbeats_total",
        "Total heartbeat deliveries received from the broker"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total deliveries rejected by parsing or validation"
    ))
    .unwrap();
    pub static ref TIMESERIES_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_timeseries_failures_total",
        "Total time-series point writes that failed"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_store_failures_total",
        "Total key-value store operations that failed"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total device status upsert failures"
    ))
    .unwrap();
    pub static ref STATUS_CHANGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_status_changes_total",
        "Total device status transitions persisted"
    ))
    .unwrap();
    pub static ref SWEEP_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_sweep_latency_seconds",
            "Time taken by one liveness sweep"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref AGGREGATES_EMITTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_aggregates_emitted_total",
        "Total region aggregates flushed to subscribers"
    ))
    .unwrap();
    pub static ref SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_subscribers",
        "Current number of registered WebSocket subscribers"
    ))
    .unwrap();
    pub static ref DROPPED_DELIVERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_dropped_deliveries_total",
        "Total fan-out deliveries that failed and unregistered their subscriber"
    ))
    .unwrap();
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(MEASUREMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HEARTBEATS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TIMESERIES_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_CHANGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SWEEP_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(AGGREGATES_EMITTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SUBSCRIBERS.clone()))?;
    REGISTRY.register(Box::new(DROPPED_DELIVERIES_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Validation(format!("metrics are not UTF-8: {}", e)))
}
