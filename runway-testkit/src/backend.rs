use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use runway::{Backend, BackendReply, CallError, RunId, RunParameters, RunRequest};
use tokio::time::Instant;

/// One scripted reply.
pub type Step = Result<BackendReply, CallError>;

/// What a backend saw on one call.
#[derive(Clone, Debug)]
pub struct CallRecord {
    pub run_id: RunId,
    pub prompt_text: String,
    pub parameters: RunParameters,
    pub mitigation_attempt: u32,
    pub at: Instant,
}

impl CallRecord {
    fn of(request: &RunRequest) -> Self {
        Self {
            run_id: request.run_id.clone(),
            prompt_text: request.prompt_text.clone(),
            parameters: request.parameters,
            mitigation_attempt: request.mitigation_attempt,
            at: Instant::now(),
        }
    }
}

/// Backend that plays back scripted replies per run id.
///
/// Runs without a script (or whose script ran out) get an echo of their
/// prompt. Clones share the script and the call log.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    scripts: Arc<Mutex<HashMap<RunId, VecDeque<Step>>>>,
    health: Arc<Mutex<VecDeque<bool>>>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
    health_checks: Arc<Mutex<u32>>,
    latency: Duration,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes `latency` of tokio time before replying.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_script(self, run_id: impl Into<RunId>, steps: Vec<Step>) -> Self {
        self.push_steps(run_id, steps);
        self
    }

    /// Health answers in order; the last one repeats. Healthy when empty.
    pub fn with_health(self, answers: Vec<bool>) -> Self {
        *self.health.lock() = answers.into();
        self
    }

    pub fn push_steps(&self, run_id: impl Into<RunId>, steps: Vec<Step>) {
        self.scripts
            .lock()
            .entry(run_id.into())
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, run_id: &str) -> Vec<CallRecord> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.run_id.as_str() == run_id)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn health_checks(&self) -> u32 {
        *self.health_checks.lock()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "Expected {expected} calls, got {actual}");
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn call(&self, request: &RunRequest) -> Result<BackendReply, CallError> {
        self.calls.lock().push(CallRecord::of(request));
        let step = self
            .scripts
            .lock()
            .get_mut(&request.run_id)
            .and_then(VecDeque::pop_front);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        step.unwrap_or_else(|| Ok(BackendReply::text(request.prompt_text.clone())))
    }

    async fn health(&self) -> Result<(), CallError> {
        *self.health_checks.lock() += 1;
        let healthy = {
            let mut answers = self.health.lock();
            if answers.len() > 1 {
                answers.pop_front().unwrap_or(true)
            } else {
                answers.front().copied().unwrap_or(true)
            }
        };
        if healthy {
            Ok(())
        } else {
            Err(CallError::Connection("backend warming up".into()))
        }
    }
}

/// Backend that is never reachable. Records when each call was attempted.
#[derive(Clone, Default)]
pub struct UnreachableBackend {
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl UnreachableBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// Gaps between consecutive attempts.
    pub fn delays(&self) -> Vec<Duration> {
        self.attempts
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl Backend for UnreachableBackend {
    async fn call(&self, _request: &RunRequest) -> Result<BackendReply, CallError> {
        self.attempts.lock().push(Instant::now());
        Err(CallError::Connection("connection refused".into()))
    }

    async fn health(&self) -> Result<(), CallError> {
        Err(CallError::Connection("connection refused".into()))
    }
}

/// `CallError::Remote` with a body, for scripting provider rejections.
pub fn remote(status: u16, body: &str) -> Step {
    Err(CallError::remote(status, body))
}

/// `CallError::Connection`, for scripting unreachable attempts.
pub fn unreachable() -> Step {
    Err(CallError::Connection("connection refused".into()))
}

pub fn reply(output: &str) -> Step {
    Ok(BackendReply::text(output))
}
