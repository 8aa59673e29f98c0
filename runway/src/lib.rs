//! Runway - the automation execution core of the eval studio.
//!
//! Takes a batch of evaluation runs (OCR, prompt, chat), executes them in
//! order against a model backend, recovers from transient and
//! provider-specific failures, and streams progress snapshots to the UI.
//!
//! # Core Concepts
//!
//! - **Job**: An ordered batch of runs submitted through
//!   [`JobOrchestrator::submit`]. Runs inside a job never overlap; jobs run
//!   concurrently with each other.
//!
//! - **Transport**: [`ResilientTransport`] wraps a [`Backend`] and retries
//!   only connection-level failures, with a capped progressive backoff. It
//!   also probes backend readiness before a job starts.
//!
//! - **Mitigation**: [`StandardMitigationPolicy`] classifies what the
//!   backend rejected (context length, rate limit, transient) and proposes a
//!   revised request and delay. The orchestrator bounds these retries per
//!   run.
//!
//! - **Progress**: [`ProgressPublisher`] fans the current list of
//!   [`ProgressSnapshot`]s out to every subscriber after each state change.
//!
//! - **Events and history**: lifecycle [`RunEvent`]s go to a
//!   [`RunEventPublisher`]; finished jobs are exported as [`RunOutcome`]s to
//!   an optional [`HistorySink`].
//!
//! # Feature Flags
//!
//! - `http` - [`HttpBackend`] speaking the studio REST API via reqwest
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use runway::*;
//!
//! let orchestrator = OrchestratorBuilder::new(RunwayConfig::default())
//!     .with_backend(EchoBackend::new())
//!     .build()?;
//!
//! let _progress = orchestrator.publisher().subscribe(|jobs| {
//!     for job in jobs {
//!         println!("{}: {} of {}", job.name, job.current_run_index, job.total_runs);
//!     }
//! });
//!
//! let job_id = orchestrator.submit(JobConfig::new("smoke").with_run(run))?;
//! let job = orchestrator.join(job_id).await?;
//! ```

/// Model backends: the raw call behind the transport.
///
/// [`Backend`] is the seam; [`EchoBackend`] answers offline and
/// [`HttpBackend`] (feature `http`) calls the studio server.
pub mod backend;

/// Configuration for the transport, probe, mitigation and orchestrator,
/// loadable from JSON.
pub mod config;

/// Error types for every layer.
pub mod error;

/// Lifecycle events and the in-process [`RunEventBus`].
pub mod events;

/// Export records and the [`HistorySink`] hand-off.
pub mod history;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled with the `metrics` feature.
pub mod metrics;

/// Error classification and corrective retry decisions.
pub mod mitigation;

/// Progress snapshots and subscriber fan-out.
pub mod progress;

/// Run and job definitions submitted by callers.
pub mod run;

/// Job orchestration: submission, sequential execution and cancellation.
pub mod runtime;

/// Run state machine and the derived job view.
pub mod state;

/// Tracing spans and structured logging helpers.
pub mod telemetry;

/// Resilient call execution and readiness probing.
pub mod transport;

pub use backend::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use history::*;
pub use mitigation::*;
pub use progress::*;
pub use run::*;
pub use runtime::*;
pub use state::*;
pub use transport::{ResilientTransport, Transport};
