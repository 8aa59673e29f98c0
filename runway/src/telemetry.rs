//! Tracing and telemetry instrumentation for runway.
//!
//! Span constructors for the job, run, execute and probe scopes, plus
//! `record_*` helpers that log a structured event and, with the `metrics`
//! feature, update the matching Prometheus series. Every helper works with
//! the feature disabled.

use std::time::{Duration, Instant};

use tracing::{info_span, Span};
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Span covering a whole job task.
#[must_use]
pub fn job_span(job_id: impl AsRef<str>, name: impl AsRef<str>) -> Span {
    info_span!(
        "runway.job",
        job_id = %job_id.as_ref(),
        job_name = %name.as_ref(),
    )
}

/// Span covering one run, mitigated retries included.
#[must_use]
pub fn run_span(run_id: impl AsRef<str>, kind: impl AsRef<str>, index: usize) -> Span {
    info_span!(
        "runway.run",
        run_id = %run_id.as_ref(),
        run_kind = %kind.as_ref(),
        index = index,
    )
}

/// Span covering one logical transport call.
#[must_use]
pub fn execute_span(run_id: impl AsRef<str>, kind: impl AsRef<str>) -> Span {
    info_span!(
        "runway.execute",
        run_id = %run_id.as_ref(),
        run_kind = %kind.as_ref(),
    )
}

#[must_use]
pub fn probe_span(deadline: Duration) -> Span {
    info_span!("runway.probe", deadline_ms = deadline.as_millis() as u64)
}

/// Record a connection-level retry inside the transport.
pub fn record_transport_retry(attempt: u32, delay: Duration, error: &str) {
    tracing::warn!(
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "backend unreachable, retrying"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_transport_retry();
}

/// Record a mitigation decision that schedules another attempt.
pub fn record_mitigation(class: impl AsRef<str>, attempt: u32, delay_ms: u64) {
    tracing::warn!(
        class = %class.as_ref(),
        attempt = attempt,
        delay_ms = delay_ms,
        "run failed, mitigated retry scheduled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_mitigation(class.as_ref());
}

/// Record a run reaching a terminal state.
pub fn record_run_finished(kind: impl AsRef<str>, status: impl AsRef<str>, duration: Duration) {
    tracing::info!(
        run_kind = %kind.as_ref(),
        status = %status.as_ref(),
        duration_ms = duration.as_millis() as u64,
        "run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_run_finished(kind.as_ref(), status.as_ref(), duration.as_secs_f64());
}

/// Record a job task starting.
pub fn record_job_started(total_runs: usize) {
    tracing::info!(total_runs = total_runs, "job started");

    #[cfg(feature = "metrics")]
    crate::metrics::adjust_jobs_active(1.0);
}

/// Record a job task ending, however it ended.
pub fn record_job_ended(status: impl AsRef<str>, completed: usize, failed: usize) {
    tracing::info!(
        status = %status.as_ref(),
        completed = completed,
        failed = failed,
        "job ended"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::adjust_jobs_active(-1.0);
}

/// Measures wall time of a run across its attempts.
#[derive(Debug)]
pub struct RunTimer {
    start: Instant,
}

impl RunTimer {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
