/// Builder for constructing orchestrator instances.
pub mod builder;
/// Job orchestrator and per-job cancellation.
pub mod supervisor;
/// The per-job task that drives runs to completion.
pub mod worker;

pub use builder::OrchestratorBuilder;
pub use supervisor::{CancelToken, JobOrchestrator};
pub use worker::CANCELLED_MESSAGE;
