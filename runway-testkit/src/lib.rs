//! Test doubles and fixtures for runway.
//!
//! - [`ScriptedBackend`] plays back per-run replies and logs every call.
//! - [`UnreachableBackend`] fails every call at the connection level.
//! - [`RunConfigBuilder`] builds run configs with sensible defaults.
//! - [`InMemoryHistory`] stores exported outcomes.

mod backend;
mod fixtures;
mod history;

pub use backend::{remote, reply, unreachable, CallRecord, ScriptedBackend, Step, UnreachableBackend};
pub use fixtures::{job_with_runs, RunConfigBuilder};
pub use history::InMemoryHistory;
