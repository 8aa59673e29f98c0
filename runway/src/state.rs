use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::run::{JobId, RunConfig, RunRequest, RunResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
enum RunPhase {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Completed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: RunResult,
    },
    Error {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        message: String,
    },
}

/// Execution state of one run.
///
/// The phase is private; it only moves through the guarded transition
/// methods, so a completed run can never be restarted and an error run only
/// returns to running while the mitigation budget allows it.
#[derive(Clone, Debug, PartialEq)]
pub struct RunState {
    phase: RunPhase,
    mitigation_attempts: u32,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Pending,
            mitigation_attempts: 0,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self.phase {
            RunPhase::Pending => RunStatus::Pending,
            RunPhase::Running { .. } => RunStatus::Running,
            RunPhase::Completed { .. } => RunStatus::Completed,
            RunPhase::Error { .. } => RunStatus::Error,
        }
    }

    pub fn result(&self) -> Option<&RunResult> {
        match &self.phase {
            RunPhase::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.phase {
            RunPhase::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            RunPhase::Pending => None,
            RunPhase::Running { started_at }
            | RunPhase::Completed { started_at, .. }
            | RunPhase::Error { started_at, .. } => Some(*started_at),
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            RunPhase::Completed { finished_at, .. } | RunPhase::Error { finished_at, .. } => {
                Some(*finished_at)
            }
            _ => None,
        }
    }

    pub fn mitigation_attempts(&self) -> u32 {
        self.mitigation_attempts
    }

    /// `pending -> running`.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.phase {
            RunPhase::Pending => {
                self.phase = RunPhase::Running { started_at: at };
                Ok(())
            }
            _ => Err(self.illegal(RunStatus::Running)),
        }
    }

    /// `running -> completed`.
    pub fn complete(&mut self, result: RunResult, at: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.phase {
            RunPhase::Running { started_at } => {
                self.phase = RunPhase::Completed {
                    started_at,
                    finished_at: at,
                    result,
                };
                Ok(())
            }
            _ => Err(self.illegal(RunStatus::Completed)),
        }
    }

    /// `running -> error`.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.phase {
            RunPhase::Running { started_at } => {
                self.phase = RunPhase::Error {
                    started_at,
                    finished_at: at,
                    message: message.into(),
                };
                Ok(())
            }
            _ => Err(self.illegal(RunStatus::Error)),
        }
    }

    /// `error -> running`, the only back-edge. Consumes one unit of the
    /// mitigation budget and keeps the original start time.
    pub fn retry(&mut self, budget: u32) -> Result<(), TransitionError> {
        match self.phase {
            RunPhase::Error { started_at, .. } => {
                if self.mitigation_attempts >= budget {
                    return Err(TransitionError::BudgetExhausted { budget });
                }
                self.mitigation_attempts += 1;
                self.phase = RunPhase::Running { started_at };
                Ok(())
            }
            _ => Err(self.illegal(RunStatus::Running)),
        }
    }

    fn illegal(&self, to: RunStatus) -> TransitionError {
        TransitionError::Illegal {
            from: self.status(),
            to,
        }
    }
}

/// A run as the orchestrator tracks it.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSlot {
    pub config: RunConfig,
    pub state: RunState,
    /// Last request handed to the transport, post-mitigation.
    pub applied: Option<RunRequest>,
}

impl RunSlot {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            state: RunState::new(),
            applied: None,
        }
    }
}

/// Derived job status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub runs: Vec<RunSlot>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, runs: Vec<RunConfig>) -> Self {
        Self {
            id,
            name: name.into(),
            runs: runs.into_iter().map(RunSlot::new).collect(),
            created_at: Utc::now(),
            completed_at: None,
            cancelled_at: None,
        }
    }

    /// Running while anything is in flight or still pending, completed once
    /// every run is terminal regardless of how many failed. A cancelled job
    /// never reports completed.
    pub fn status(&self) -> JobStatus {
        if self.count(RunStatus::Running) > 0 {
            return JobStatus::Running;
        }
        if self.cancelled_at.is_some() {
            return JobStatus::Cancelled;
        }
        if self.count(RunStatus::Pending) > 0 {
            JobStatus::Running
        } else {
            JobStatus::Completed
        }
    }

    /// 1-based position of the run in flight, otherwise the number of runs
    /// that reached a terminal state.
    pub fn current_run_index(&self) -> usize {
        self.runs
            .iter()
            .position(|slot| slot.state.status() == RunStatus::Running)
            .map(|index| index + 1)
            .unwrap_or_else(|| {
                self.runs
                    .iter()
                    .filter(|slot| slot.state.status().is_terminal())
                    .count()
            })
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.runs
            .iter()
            .filter(|slot| slot.state.status() == status)
            .count()
    }

    pub fn total_runs(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{ModelReference, Provider, RunId, RunKind, RunParameters};

    fn config(id: &str) -> RunConfig {
        RunConfig {
            id: RunId::from(id),
            name: id.to_string(),
            kind: RunKind::Prompt,
            model: ModelReference::new("stub:echo", Provider::Local),
            parameters: RunParameters::default(),
            prompt_text: "hello".into(),
            context_text: None,
            attached_file_refs: vec![],
            requested_metrics: Default::default(),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = RunState::new();
        let t0 = Utc::now();
        state.start(t0).unwrap();
        assert_eq!(state.status(), RunStatus::Running);
        assert_eq!(state.started_at(), Some(t0));

        state.complete(RunResult::new(), t0).unwrap();
        assert_eq!(state.status(), RunStatus::Completed);
        assert_eq!(state.finished_at(), Some(t0));
        assert!(state.result().is_some());
    }

    #[test]
    fn test_completed_run_cannot_retry() {
        let mut state = RunState::new();
        state.start(Utc::now()).unwrap();
        state.complete(RunResult::new(), Utc::now()).unwrap();

        let err = state.retry(2).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: RunStatus::Completed,
                to: RunStatus::Running,
            }
        );
    }

    #[test]
    fn test_retry_respects_budget() {
        let mut state = RunState::new();
        let started = Utc::now();
        state.start(started).unwrap();

        for expected in 1..=2 {
            state.fail("boom", Utc::now()).unwrap();
            state.retry(2).unwrap();
            assert_eq!(state.mitigation_attempts(), expected);
            assert_eq!(state.started_at(), Some(started));
        }

        state.fail("boom", Utc::now()).unwrap();
        assert_eq!(
            state.retry(2),
            Err(TransitionError::BudgetExhausted { budget: 2 })
        );
        assert_eq!(state.status(), RunStatus::Error);
        assert_eq!(state.error_message(), Some("boom"));
        assert_eq!(state.mitigation_attempts(), 2);
    }

    #[test]
    fn test_pending_run_cannot_complete() {
        let mut state = RunState::new();
        assert!(state.complete(RunResult::new(), Utc::now()).is_err());
        assert!(state.fail("x", Utc::now()).is_err());
        assert_eq!(state.status(), RunStatus::Pending);
    }

    #[test]
    fn test_job_status_partial_failure_is_completed() {
        let mut job = Job::new(JobId::new(), "mixed", vec![config("a"), config("b")]);
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.current_run_index(), 0);

        job.runs[0].state.start(Utc::now()).unwrap();
        assert_eq!(job.current_run_index(), 1);
        job.runs[0].state.complete(RunResult::new(), Utc::now()).unwrap();
        job.runs[1].state.start(Utc::now()).unwrap();
        assert_eq!(job.current_run_index(), 2);
        job.runs[1].state.fail("nope", Utc::now()).unwrap();

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.current_run_index(), 2);
        assert_eq!(job.count(RunStatus::Error), 1);
    }

    #[test]
    fn test_cancelled_job_never_completes() {
        let mut job = Job::new(JobId::new(), "halted", vec![config("a"), config("b")]);
        job.runs[0].state.start(Utc::now()).unwrap();
        job.cancelled_at = Some(Utc::now());
        assert_eq!(job.status(), JobStatus::Running);

        job.runs[0].state.complete(RunResult::new(), Utc::now()).unwrap();
        assert_eq!(job.status(), JobStatus::Cancelled);
    }
}
