use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::mitigation::ErrorClass;
use crate::run::{JobId, RunId, RunKind};
use crate::state::JobStatus;

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub job_id: JobId,
    /// Monotonically increasing within one job, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle event emitted by a job task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    /// Job accepted and its task spawned.
    JobSubmitted { name: String, total_runs: usize },
    /// Readiness probe finished before the first run.
    BackendProbed { ready: bool },
    /// A run left `pending`.
    RunStarted {
        run_id: RunId,
        kind: RunKind,
        index: usize,
    },
    /// The request is likely over the model's token budget.
    PreflightWarning {
        run_id: RunId,
        estimated_tokens: usize,
        max_tokens: u32,
    },
    /// A failed attempt will be retried after `delay_ms`.
    MitigationScheduled {
        run_id: RunId,
        class: ErrorClass,
        attempt: u32,
        delay_ms: u64,
    },
    RunCompleted { run_id: RunId },
    RunFailed {
        run_id: RunId,
        class: Option<ErrorClass>,
        message: String,
    },
    /// Every run is terminal.
    JobFinished {
        status: JobStatus,
        completed_runs: usize,
        failed_runs: usize,
    },
    JobCancelled,
}

/// Publishes run events to interested parties.
#[async_trait]
pub trait RunEventPublisher: Send + Sync {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
pub struct RunEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl RunEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget send; an event with no subscribers is dropped.
    pub fn send(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl RunEventPublisher for RunEventBus {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        self.send(event);
        Ok(())
    }
}

/// Stamps events for one job with its id and next sequence number.
#[derive(Debug)]
pub struct EventSequencer {
    job_id: JobId,
    next: AtomicU64,
}

impl EventSequencer {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            next: AtomicU64::new(1),
        }
    }

    pub fn event(&self, payload: RunEventPayload) -> RunEvent {
        RunEvent {
            meta: EventMeta {
                job_id: self.job_id,
                sequence: self.next.fetch_add(1, Ordering::Relaxed),
                timestamp: Utc::now(),
            },
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = RunEventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let sequencer = EventSequencer::new(JobId::new());
        bus.publish(sequencer.event(RunEventPayload::JobCancelled))
            .await
            .unwrap();

        let a = timeout(Duration::from_secs(1), first.recv()).await.unwrap().unwrap();
        let b = timeout(Duration::from_secs(1), second.recv()).await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.payload, RunEventPayload::JobCancelled);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = RunEventBus::new(4);
        let sequencer = EventSequencer::new(JobId::new());
        assert!(bus
            .publish(sequencer.event(RunEventPayload::BackendProbed { ready: true }))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = RunEventBus::new(2);
        let mut rx = bus.subscribe();
        let sequencer = EventSequencer::new(JobId::new());

        for _ in 0..5 {
            bus.send(sequencer.event(RunEventPayload::JobCancelled));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().meta.sequence, 4);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let sequencer = EventSequencer::new(JobId::new());
        let sequences: Vec<u64> = (0..3)
            .map(|_| sequencer.event(RunEventPayload::JobCancelled).meta.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let payload = RunEventPayload::MitigationScheduled {
            run_id: RunId::from("r1"),
            class: ErrorClass::RateLimited,
            attempt: 1,
            delay_ms: 1_000,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "mitigation_scheduled");
        assert_eq!(json["class"], "rate_limited");
    }
}
