use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::history::RunOutcome;
use crate::progress::ProgressPublisher;
use crate::run::{JobConfig, JobId};
use crate::state::{Job, JobStatus};

use super::worker::{JobWorker, Services};

/// Cooperative cancellation flag shared between a job's handle and its task.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

#[derive(Debug)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

struct JobEntry {
    job: Arc<Mutex<Job>>,
    cancel: CancelToken,
    done: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

/// Runs submitted jobs, one tokio task per job.
///
/// Runs inside a job execute strictly in order; separate jobs proceed
/// concurrently. Every method that takes a [`JobId`] reports
/// [`OrchestratorError::JobNotFound`] for ids it does not hold.
pub struct JobOrchestrator {
    services: Arc<Services>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

impl fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.services.config)
            .field("jobs", &self.jobs.lock().len())
            .field("history_set", &self.services.history.is_some())
            .finish()
    }
}

impl JobOrchestrator {
    pub(crate) fn new(services: Services) -> Self {
        Self {
            services: Arc::new(services),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.services.config
    }

    pub fn publisher(&self) -> &ProgressPublisher {
        &self.services.publisher
    }

    /// Validate the job, publish its initial snapshot and spawn its task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, config: JobConfig) -> Result<JobId, OrchestratorError> {
        validate_job(&config)?;

        let job_id = JobId::new();
        let job = Job::new(job_id, config.name, config.runs);
        tracing::info!(job_id = %job_id, job_name = %job.name, runs = job.total_runs(), "job submitted");
        self.services.publisher.publish(&job);

        let job = Arc::new(Mutex::new(job));
        let cancel = CancelToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let worker = JobWorker::new(Arc::clone(&self.services), Arc::clone(&job), cancel.clone());

        let mut jobs = self.jobs.lock();
        let task = tokio::spawn(worker.run(done_tx));
        jobs.insert(
            job_id,
            JobEntry {
                job,
                cancel,
                done: done_rx,
                task: Some(task),
            },
        );

        Ok(job_id)
    }

    /// Request cancellation. Runs already finished are kept, the run in
    /// flight ends as `error`, later runs stay `pending`. No effect on a job
    /// that already finished.
    pub fn cancel(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        let (job, token) = {
            let jobs = self.jobs.lock();
            let entry = jobs.get(&job_id).ok_or(OrchestratorError::JobNotFound(job_id))?;
            (Arc::clone(&entry.job), entry.cancel.clone())
        };

        let mut job = job.lock();
        if job.status() == JobStatus::Running && job.cancelled_at.is_none() {
            job.cancelled_at = Some(Utc::now());
            token.cancel();
            tracing::info!(job_id = %job_id, "job cancellation requested");
        }
        Ok(())
    }

    /// A copy of the job as it is right now.
    pub fn job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        Ok(self.entry_job(job_id)?.lock().clone())
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.lock().keys().copied().collect()
    }

    /// Outcomes of the job's terminal runs.
    pub fn export(&self, job_id: JobId) -> Result<Vec<RunOutcome>, OrchestratorError> {
        Ok(self.entry_job(job_id)?.lock().outcomes())
    }

    /// Wait for the job's task to finish and return the final job.
    pub async fn join(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        let (job, mut done) = {
            let jobs = self.jobs.lock();
            let entry = jobs.get(&job_id).ok_or(OrchestratorError::JobNotFound(job_id))?;
            (Arc::clone(&entry.job), entry.done.clone())
        };

        if done.wait_for(|finished| *finished).await.is_err() {
            tracing::warn!(job_id = %job_id, "job task ended without signalling completion");
        }
        let job = job.lock().clone();
        Ok(job)
    }

    /// Cancel the job if needed, wait for it, then forget it and its
    /// snapshot.
    pub async fn discard(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        self.cancel(job_id)?;
        let job = self.join(job_id).await?;

        let entry = self.jobs.lock().remove(&job_id);
        if let Some(task) = entry.and_then(|entry| entry.task) {
            if let Err(err) = task.await {
                tracing::warn!(job_id = %job_id, error = %err, "job task failed");
            }
        }
        self.services.publisher.remove(job_id);
        Ok(job)
    }

    /// Cancel every job and wait for all job tasks to exit.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("shutting down job orchestrator");

        for job_id in self.job_ids() {
            // A concurrent discard may have removed the job already.
            match self.cancel(job_id) {
                Ok(()) | Err(OrchestratorError::JobNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let tasks: Vec<(JobId, JoinHandle<()>)> = {
            let mut jobs = self.jobs.lock();
            jobs.iter_mut()
                .filter_map(|(id, entry)| entry.task.take().map(|task| (*id, task)))
                .collect()
        };

        for (job_id, task) in tasks {
            if let Err(err) = task.await {
                tracing::warn!(job_id = %job_id, error = %err, "job task failed");
            }
        }

        tracing::info!("job orchestrator shutdown complete");
        Ok(())
    }

    fn entry_job(&self, job_id: JobId) -> Result<Arc<Mutex<Job>>, OrchestratorError> {
        self.jobs
            .lock()
            .get(&job_id)
            .map(|entry| Arc::clone(&entry.job))
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }
}

fn validate_job(config: &JobConfig) -> Result<(), OrchestratorError> {
    if config.runs.is_empty() {
        return Err(OrchestratorError::NoRunsConfigured);
    }

    let mut seen = HashSet::new();
    for run in &config.runs {
        if !seen.insert(&run.id) {
            return Err(OrchestratorError::DuplicateRunId(run.id.clone()));
        }
        run.parameters.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendReply;
    use crate::error::TransportError;
    use crate::events::RunEventBus;
    use crate::mitigation::StandardMitigationPolicy;
    use crate::run::{ModelReference, Provider, RunConfig, RunId, RunKind, RunParameters, RunRequest};
    use crate::state::RunStatus;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Replies after `delay`, echoing the prompt.
    struct SlowTransport {
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn execute(&self, request: &RunRequest) -> Result<BackendReply, TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(BackendReply::text(request.prompt_text.clone()))
        }

        async fn probe_ready(&self, _deadline: Duration) -> bool {
            true
        }
    }

    fn orchestrator(delay: Duration) -> JobOrchestrator {
        JobOrchestrator::new(Services {
            transport: Arc::new(SlowTransport { delay }),
            policy: Arc::new(StandardMitigationPolicy::default()),
            publisher: ProgressPublisher::new(),
            events: Arc::new(RunEventBus::new(64)),
            history: None,
            config: OrchestratorConfig::default(),
        })
    }

    fn run(id: &str) -> RunConfig {
        RunConfig {
            id: RunId::from(id),
            name: id.to_string(),
            kind: RunKind::Prompt,
            model: ModelReference::new("stub:echo", Provider::Local),
            parameters: RunParameters::default(),
            prompt_text: format!("prompt {id}"),
            context_text: None,
            attached_file_refs: vec![],
            requested_metrics: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_cancel_token_shared_state() {
        let token = CancelToken::new();
        let clone = token.clone();

        token.cancel();

        assert!(clone.is_cancelled());
        timeout(Duration::from_secs(1), clone.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::default();
        assert!(!token.is_cancelled());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("waiters did not observe cancellation");
        for result in results {
            result.expect("waiter panicked");
        }
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_jobs() {
        let orchestrator = orchestrator(Duration::ZERO);

        assert!(matches!(
            orchestrator.submit(JobConfig::new("empty")),
            Err(OrchestratorError::NoRunsConfigured)
        ));

        let duplicate = JobConfig::new("dup").with_run(run("a")).with_run(run("a"));
        assert!(matches!(
            orchestrator.submit(duplicate),
            Err(OrchestratorError::DuplicateRunId(id)) if id.as_str() == "a"
        ));

        let mut hot = run("hot");
        hot.parameters.temperature = 5.0;
        assert!(matches!(
            orchestrator.submit(JobConfig::new("hot").with_run(hot)),
            Err(OrchestratorError::InvalidConfig(_))
        ));

        assert!(orchestrator.job_ids().is_empty());
        assert!(orchestrator.publisher().snapshot_all().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_id() {
        let orchestrator = orchestrator(Duration::ZERO);
        let missing = JobId::new();

        assert!(matches!(orchestrator.cancel(missing), Err(OrchestratorError::JobNotFound(id)) if id == missing));
        assert!(matches!(orchestrator.job(missing), Err(OrchestratorError::JobNotFound(_))));
        assert!(matches!(orchestrator.export(missing), Err(OrchestratorError::JobNotFound(_))));
        assert!(matches!(orchestrator.join(missing).await, Err(OrchestratorError::JobNotFound(_))));
        assert!(matches!(orchestrator.discard(missing).await, Err(OrchestratorError::JobNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_then_discard() {
        let orchestrator = orchestrator(Duration::from_millis(10));
        let job_id = orchestrator
            .submit(JobConfig::new("pair").with_run(run("a")).with_run(run("b")))
            .unwrap();

        let job = orchestrator.join(job_id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(orchestrator.export(job_id).unwrap().len(), 2);

        // Cancelling a finished job changes nothing.
        orchestrator.cancel(job_id).unwrap();
        assert_eq!(orchestrator.job(job_id).unwrap().status(), JobStatus::Completed);

        orchestrator.discard(job_id).await.unwrap();
        assert!(matches!(orchestrator.job(job_id), Err(OrchestratorError::JobNotFound(_))));
        assert!(orchestrator.publisher().snapshot(job_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_running_jobs() {
        let orchestrator = orchestrator(Duration::from_secs(5));
        let job_id = orchestrator
            .submit(JobConfig::new("long").with_run(run("a")).with_run(run("b")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        orchestrator.shutdown().await.unwrap();

        let job = orchestrator.job(job_id).unwrap();
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.runs[0].state.status(), RunStatus::Error);
        assert_eq!(job.runs[0].state.error_message(), Some("cancelled"));
        assert_eq!(job.runs[1].state.status(), RunStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_tolerates_concurrent_discard() {
        let orchestrator = Arc::new(orchestrator(Duration::from_millis(20)));
        let job_ids: Vec<JobId> = (0..16)
            .map(|i| {
                orchestrator
                    .submit(JobConfig::new(format!("job {i}")).with_run(run("a")))
                    .unwrap()
            })
            .collect();

        let discards: Vec<_> = job_ids
            .iter()
            .step_by(2)
            .map(|job_id| {
                let orchestrator = Arc::clone(&orchestrator);
                let job_id = *job_id;
                tokio::spawn(async move { orchestrator.discard(job_id).await })
            })
            .collect();

        orchestrator.shutdown().await.unwrap();
        for discard in discards {
            discard.await.unwrap().unwrap();
        }

        for job_id in orchestrator.job_ids() {
            assert_ne!(orchestrator.job(job_id).unwrap().status(), JobStatus::Running);
        }
        assert!(orchestrator.job_ids().len() <= job_ids.len() / 2);
    }
}
