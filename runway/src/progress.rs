//! Progress snapshots pushed to UI subscribers.
//!
//! The publisher keeps the latest [`ProgressSnapshot`] of every job it has
//! seen, in submission order, and hands the whole list to every subscriber
//! whenever a job changes. Delivery is synchronous on the publishing task.
//!
//! Callbacks run while the delivery lock is held. They may call
//! [`ProgressPublisher::snapshot_all`] or drop a [`Subscription`], but must
//! not publish.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::run::{JobId, RunKind};
use crate::state::{Job, JobStatus, RunStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Error,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Running => "running",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::Running)
    }
}

impl From<JobStatus> for ProgressStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Running => ProgressStatus::Running,
            JobStatus::Completed => ProgressStatus::Completed,
            JobStatus::Cancelled => ProgressStatus::Error,
        }
    }
}

/// Immutable projection of a job's execution state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub name: String,
    /// Kind of the job's first run.
    pub kind: RunKind,
    pub status: ProgressStatus,
    pub current_run_index: usize,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
}

impl From<&Job> for ProgressSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            kind: job
                .runs
                .first()
                .map(|slot| slot.config.kind)
                .unwrap_or(RunKind::Prompt),
            status: job.status().into(),
            current_run_index: job.current_run_index(),
            total_runs: job.total_runs(),
            completed_runs: job.count(RunStatus::Completed),
            failed_runs: job.count(RunStatus::Error),
        }
    }
}

type Callback = Arc<dyn Fn(&[ProgressSnapshot]) + Send + Sync>;

#[derive(Default)]
struct Registry {
    snapshots: Vec<ProgressSnapshot>,
    subscribers: Vec<(u64, Callback)>,
    next_subscriber: u64,
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    delivery: Mutex<()>,
}

impl Shared {
    fn unsubscribe(&self, id: u64) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(existing, _)| *existing != id);
        registry.subscribers.len() != before
    }
}

/// Fan-out of job snapshots to registered callbacks. Cloning shares state.
#[derive(Clone, Default)]
pub struct ProgressPublisher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProgressPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.shared.registry.lock();
        f.debug_struct("ProgressPublisher")
            .field("jobs", &registry.snapshots.len())
            .field("subscribers", &registry.subscribers.len())
            .finish()
    }
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the job's snapshot and notify every subscriber.
    pub fn publish(&self, job: &Job) {
        self.publish_snapshot(ProgressSnapshot::from(job));
    }

    /// Store a precomputed snapshot and notify every subscriber.
    pub fn publish_snapshot(&self, snapshot: ProgressSnapshot) {
        self.update(|snapshots| {
            match snapshots.iter().position(|s| s.job_id == snapshot.job_id) {
                Some(index) => snapshots[index] = snapshot,
                None => snapshots.push(snapshot),
            }
            true
        });
    }

    /// Register a callback. It receives the full list on every change, and
    /// stays registered until the returned handle is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[ProgressSnapshot]) + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry.lock();
        let id = registry.next_subscriber;
        registry.next_subscriber += 1;
        registry.subscribers.push((id, Arc::new(callback)));

        Subscription {
            id,
            shared: Some(Arc::downgrade(&self.shared)),
        }
    }

    pub fn snapshot_all(&self) -> Vec<ProgressSnapshot> {
        self.shared.registry.lock().snapshots.clone()
    }

    pub fn snapshot(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        self.shared
            .registry
            .lock()
            .snapshots
            .iter()
            .find(|s| s.job_id == job_id)
            .cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.lock().subscribers.len()
    }

    /// Drop snapshots of jobs that are no longer running. Returns how many
    /// were removed; subscribers are notified when any were.
    pub fn clear_terminal(&self) -> usize {
        let mut removed = 0;
        self.update(|snapshots| {
            let before = snapshots.len();
            snapshots.retain(|s| !s.status.is_terminal());
            removed = before - snapshots.len();
            removed > 0
        });
        removed
    }

    /// Forget one job's snapshot.
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut removed = false;
        self.update(|snapshots| {
            let before = snapshots.len();
            snapshots.retain(|s| s.job_id != job_id);
            removed = snapshots.len() != before;
            removed
        });
        removed
    }

    /// Apply `change` and, if it reports a modification, deliver the new list.
    ///
    /// The delivery lock is taken before the registry is touched, so lists
    /// reach each subscriber in the order the changes were made.
    fn update(&self, change: impl FnOnce(&mut Vec<ProgressSnapshot>) -> bool) {
        let _delivery = self.shared.delivery.lock();

        let (snapshots, callbacks) = {
            let mut registry = self.shared.registry.lock();
            if !change(&mut registry.snapshots) {
                return;
            }
            let callbacks: Vec<Callback> = registry
                .subscribers
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect();
            (registry.snapshots.clone(), callbacks)
        };

        for callback in callbacks {
            callback(&snapshots);
        }
    }
}

/// Handle to a registered progress callback.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    shared: Option<Weak<Shared>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the callback registered for the publisher's whole lifetime.
    pub fn detach(mut self) {
        self.shared = None;
    }

    fn release(&mut self) {
        if let Some(shared) = self.shared.take().and_then(|weak| weak.upgrade()) {
            shared.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
