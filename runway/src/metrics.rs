//! Prometheus metrics instrumentation for runway.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `runway_runs_finished_total` - Runs that reached a terminal state
//! - `runway_mitigations_total` - Mitigated retries scheduled, by error class
//! - `runway_transport_retries_total` - Connection-level retries in the transport
//!
//! ## Gauges
//! - `runway_jobs_active` - Job tasks currently executing
//!
//! ## Histograms
//! - `runway_run_duration_seconds` - Run wall time across all attempts
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for runway metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `run_kind`, `status` (completed, error).
pub static RUNS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runway_runs_finished_total",
        "Runs that reached a terminal state",
    );
    CounterVec::new(opts, &["run_kind", "status"])
        .expect("runway_runs_finished_total metric creation failed")
});

/// Labels: `class` (context_length_exceeded, rate_limited, transient_network).
pub static MITIGATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runway_mitigations_total", "Mitigated retries scheduled");
    CounterVec::new(opts, &["class"]).expect("runway_mitigations_total metric creation failed")
});

pub static TRANSPORT_RETRIES_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "runway_transport_retries_total",
        "Connection-level retries performed by the transport",
    )
    .expect("runway_transport_retries_total metric creation failed")
});

pub static JOBS_ACTIVE: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("runway_jobs_active", "Job tasks currently executing")
        .expect("runway_jobs_active metric creation failed")
});

/// Labels: `run_kind`, `status`.
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "runway_run_duration_seconds",
        "Run wall time across all attempts",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["run_kind", "status"])
        .expect("runway_run_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_FINISHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(MITIGATIONS_TOTAL.clone()),
        Box::new(TRANSPORT_RETRIES_TOTAL.clone()),
        Box::new(JOBS_ACTIVE.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_transport_retry() {
    TRANSPORT_RETRIES_TOTAL.inc();
}

pub fn record_mitigation(class: &str) {
    MITIGATIONS_TOTAL.with_label_values(&[class]).inc();
}

pub fn observe_run_finished(run_kind: &str, status: &str, duration_secs: f64) {
    RUNS_FINISHED_TOTAL
        .with_label_values(&[run_kind, status])
        .inc();
    RUN_DURATION_SECONDS
        .with_label_values(&[run_kind, status])
        .observe(duration_secs);
}

pub fn adjust_jobs_active(delta: f64) {
    JOBS_ACTIVE.add(delta);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
