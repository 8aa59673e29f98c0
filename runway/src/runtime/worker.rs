use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::OrchestratorConfig;
use crate::error::TransitionError;
use crate::events::{EventSequencer, RunEventPayload, RunEventPublisher};
use crate::history::HistorySink;
use crate::mitigation::{estimate_tokens, ErrorClass, MitigationPolicy};
use crate::progress::{ProgressPublisher, ProgressSnapshot};
use crate::run::{JobId, ResultValue, RunRequest};
use crate::state::{Job, JobStatus, RunStatus};
use crate::telemetry::{self, RunTimer};
use crate::transport::Transport;

use super::supervisor::CancelToken;

/// Error message recorded on a run interrupted by `cancel`.
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Dependencies shared by every job task.
pub(crate) struct Services {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) policy: Arc<dyn MitigationPolicy>,
    pub(crate) publisher: ProgressPublisher,
    pub(crate) events: Arc<dyn RunEventPublisher>,
    pub(crate) history: Option<Arc<dyn HistorySink>>,
    pub(crate) config: OrchestratorConfig,
}

/// Drives one job's runs in order. Owns every mutation of its [`Job`].
pub(crate) struct JobWorker {
    services: Arc<Services>,
    job: Arc<Mutex<Job>>,
    job_id: JobId,
    cancel: CancelToken,
    sequencer: EventSequencer,
}

impl JobWorker {
    pub(crate) fn new(services: Arc<Services>, job: Arc<Mutex<Job>>, cancel: CancelToken) -> Self {
        let job_id = job.lock().id;
        Self {
            services,
            job,
            job_id,
            cancel,
            sequencer: EventSequencer::new(job_id),
        }
    }

    /// Run the job to the end, then flip `done`.
    pub(crate) async fn run(self, done: watch::Sender<bool>) {
        let (name, total) = {
            let job = self.job.lock();
            (job.name.clone(), job.total_runs())
        };
        let span = telemetry::job_span(self.job_id.to_string(), &name);

        async {
            telemetry::record_job_started(total);
            self.emit(RunEventPayload::JobSubmitted {
                name: name.clone(),
                total_runs: total,
            })
            .await;

            if let Err(err) = self.drive(total).await {
                tracing::error!(error = %err, "job stopped on an illegal run transition");
            }
            self.finish().await;
        }
        .instrument(span)
        .await;

        done.send_replace(true);
    }

    async fn drive(&self, total: usize) -> Result<(), TransitionError> {
        if self.services.config.probe_before_start {
            let deadline = self.services.config.probe_deadline();
            let probed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                ready = self.services.transport.probe_ready(deadline) => Some(ready),
            };
            if let Some(ready) = probed {
                if !ready {
                    tracing::warn!("backend readiness not confirmed, starting anyway");
                }
                self.emit(RunEventPayload::BackendProbed { ready }).await;
            }
        }

        for index in 0..total {
            if self.cancel.is_cancelled() {
                tracing::info!(remaining = total - index, "job cancelled, leaving runs pending");
                break;
            }
            self.execute_run(index).await?;
        }
        Ok(())
    }

    async fn execute_run(&self, index: usize) -> Result<(), TransitionError> {
        let request = self.update(|job| -> Result<RunRequest, TransitionError> {
            let slot = &mut job.runs[index];
            slot.state.start(Utc::now())?;
            Ok(slot.config.request())
        })?;
        let span = telemetry::run_span(request.run_id.as_str(), request.kind.as_str(), index + 1);

        self.emit(RunEventPayload::RunStarted {
            run_id: request.run_id.clone(),
            kind: request.kind,
            index: index + 1,
        })
        .await;

        async {
            self.preflight(&request).await;
            self.attempt(index, request).await
        }
        .instrument(span)
        .await
    }

    /// Call the transport until the run is terminal, applying mitigation
    /// between attempts.
    async fn attempt(&self, index: usize, mut request: RunRequest) -> Result<(), TransitionError> {
        let timer = RunTimer::start();
        loop {
            self.job.lock().runs[index].applied = Some(request.clone());

            let call_started = Instant::now();
            let outcome = self.services.transport.execute(&request).await;
            let latency = call_started.elapsed();

            if self.cancel.is_cancelled() {
                return self.cancel_run(index, &request, &timer).await;
            }

            let error = match outcome {
                Ok(reply) => {
                    let mut result = reply.fields;
                    result.insert("output".to_string(), ResultValue::Text(reply.output));
                    result.insert(
                        "latency_ms".to_string(),
                        ResultValue::Number(latency.as_millis() as f64),
                    );
                    self.update(|job| job.runs[index].state.complete(result, Utc::now()))?;

                    telemetry::record_run_finished(
                        request.kind.as_str(),
                        RunStatus::Completed.as_str(),
                        timer.elapsed(),
                    );
                    self.emit(RunEventPayload::RunCompleted {
                        run_id: request.run_id.clone(),
                    })
                    .await;
                    return Ok(());
                }
                Err(error) => error,
            };

            let decision = self.services.policy.classify(&error, &request);
            let budget = self.services.config.retry_budget;
            let message = error.to_string();

            let attempt = self.update(|job| -> Result<Option<u32>, TransitionError> {
                let state = &mut job.runs[index].state;
                state.fail(message.as_str(), Utc::now())?;
                if decision.should_retry && state.mitigation_attempts() < budget {
                    state.retry(budget)?;
                    Ok(Some(state.mitigation_attempts()))
                } else {
                    Ok(None)
                }
            })?;

            let Some(attempt) = attempt else {
                tracing::warn!(class = %decision.class, error = %message, "run failed");
                self.fail_run(&request, &timer, Some(decision.class), message)
                    .await;
                return Ok(());
            };

            telemetry::record_mitigation(decision.class.as_str(), attempt, decision.delay_ms);
            self.emit(RunEventPayload::MitigationScheduled {
                run_id: request.run_id.clone(),
                class: decision.class,
                attempt,
                delay_ms: decision.delay_ms,
            })
            .await;
            request = decision.apply(&request);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.cancel_run(index, &request, &timer).await;
                }
                _ = tokio::time::sleep(decision.delay()) => {}
            }
        }
    }

    async fn preflight(&self, request: &RunRequest) {
        let content = request.content();
        let max_tokens = request.parameters.max_tokens;
        if !self.services.policy.is_likely_too_long(&content, max_tokens) {
            return;
        }

        let estimated_tokens = estimate_tokens(&content);
        tracing::warn!(
            estimated_tokens,
            max_tokens,
            "request likely exceeds the model's token budget"
        );
        self.emit(RunEventPayload::PreflightWarning {
            run_id: request.run_id.clone(),
            estimated_tokens,
            max_tokens,
        })
        .await;
    }

    async fn cancel_run(
        &self,
        index: usize,
        request: &RunRequest,
        timer: &RunTimer,
    ) -> Result<(), TransitionError> {
        self.update(|job| job.runs[index].state.fail(CANCELLED_MESSAGE, Utc::now()))?;
        tracing::info!("run interrupted by cancellation");
        self.fail_run(request, timer, None, CANCELLED_MESSAGE.to_string())
            .await;
        Ok(())
    }

    async fn fail_run(
        &self,
        request: &RunRequest,
        timer: &RunTimer,
        class: Option<ErrorClass>,
        message: String,
    ) {
        telemetry::record_run_finished(
            request.kind.as_str(),
            RunStatus::Error.as_str(),
            timer.elapsed(),
        );
        self.emit(RunEventPayload::RunFailed {
            run_id: request.run_id.clone(),
            class,
            message,
        })
        .await;
    }

    async fn finish(&self) {
        let (status, completed, failed, outcomes) = self.update(|job| {
            let status = job.status();
            if status == JobStatus::Completed && job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
            (
                status,
                job.count(RunStatus::Completed),
                job.count(RunStatus::Error),
                job.outcomes(),
            )
        });

        match status {
            JobStatus::Cancelled => self.emit(RunEventPayload::JobCancelled).await,
            _ => {
                self.emit(RunEventPayload::JobFinished {
                    status,
                    completed_runs: completed,
                    failed_runs: failed,
                })
                .await
            }
        }
        telemetry::record_job_ended(status.as_str(), completed, failed);

        if status != JobStatus::Completed {
            return;
        }
        if let Some(history) = &self.services.history {
            if let Err(err) = history.save(self.job_id, &outcomes).await {
                tracing::warn!(error = %err, "failed to hand job results to history");
            }
        }
    }

    /// Mutate the job under its lock, then publish the resulting snapshot.
    fn update<R>(&self, change: impl FnOnce(&mut Job) -> R) -> R {
        let (out, snapshot) = {
            let mut job = self.job.lock();
            let out = change(&mut job);
            (out, ProgressSnapshot::from(&*job))
        };
        self.services.publisher.publish_snapshot(snapshot);
        out
    }

    async fn emit(&self, payload: RunEventPayload) {
        if let Err(err) = self.services.events.publish(self.sequencer.event(payload)).await {
            tracing::warn!(error = %err, "failed to publish run event");
        }
    }
}
