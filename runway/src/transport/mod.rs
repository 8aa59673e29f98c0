/// Retry and probe delay schedules.
pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::Instrument;

use crate::backend::{Backend, BackendReply};
use crate::config::{ProbeConfig, TransportConfig};
use crate::error::{CallError, TransportError};
use crate::run::RunRequest;
use crate::telemetry;

pub use backoff::{probe_delay, retry_delay};

/// Executes model calls on behalf of the orchestrator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one logical call, retrying unreachable-backend failures.
    async fn execute(&self, request: &RunRequest) -> Result<BackendReply, TransportError>;

    /// Poll backend liveness until healthy or `deadline` elapses.
    ///
    /// Never errors: `false` means "not confirmed ready", and callers are
    /// expected to try anyway.
    async fn probe_ready(&self, deadline: Duration) -> bool;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: &RunRequest) -> Result<BackendReply, TransportError> {
        (**self).execute(request).await
    }

    async fn probe_ready(&self, deadline: Duration) -> bool {
        (**self).probe_ready(deadline).await
    }
}

/// Wraps a [`Backend`] with bounded retry for connection-level failures.
///
/// Remote (application-level) errors pass through untouched on the first
/// occurrence. All waits are tokio timers, so dropping the returned future
/// abandons the call.
#[derive(Debug)]
pub struct ResilientTransport<B> {
    backend: B,
    config: TransportConfig,
    probe: ProbeConfig,
}

impl<B: Backend> ResilientTransport<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, TransportConfig::default(), ProbeConfig::default())
    }

    pub fn with_config(backend: B, config: TransportConfig, probe: ProbeConfig) -> Self {
        Self {
            backend,
            config,
            probe,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl<B: Backend> Transport for ResilientTransport<B> {
    async fn execute(&self, request: &RunRequest) -> Result<BackendReply, TransportError> {
        let span = telemetry::execute_span(request.run_id.as_str(), request.kind.as_str());
        let max_attempts = self.config.max_attempts.max(1);

        async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self.backend.call(request).await {
                    Ok(reply) => {
                        if attempt > 1 {
                            tracing::debug!(attempt, "backend reachable again");
                        }
                        return Ok(reply);
                    }
                    Err(CallError::Remote {
                        status,
                        body,
                        retry_after,
                    }) => {
                        tracing::debug!(status, "remote error returned to caller");
                        return Err(TransportError::Remote {
                            status,
                            body,
                            retry_after,
                        });
                    }
                    Err(CallError::Connection(message)) => {
                        if attempt >= max_attempts {
                            tracing::error!(
                                attempts = attempt,
                                error = %message,
                                "backend unreachable, giving up"
                            );
                            return Err(TransportError::TransientNetwork {
                                attempts: attempt,
                                last_error: message,
                            });
                        }

                        let delay = retry_delay(attempt, &self.config);
                        telemetry::record_transport_retry(attempt, delay, &message);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn probe_ready(&self, deadline: Duration) -> bool {
        let span = telemetry::probe_span(deadline);

        async move {
            let deadline_at = Instant::now() + deadline;
            let mut poll = 0u32;
            loop {
                poll += 1;
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.backend.health()).await {
                    Ok(Ok(())) => {
                        tracing::info!(polls = poll, "backend ready");
                        return true;
                    }
                    Ok(Err(err)) => tracing::debug!(poll, error = %err, "backend not ready"),
                    Err(_) => tracing::debug!(poll, "health check hit the probe deadline"),
                }

                let remaining = deadline_at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::warn!(polls = poll, "backend readiness not confirmed before deadline");
                    return false;
                }
                tokio::time::sleep(probe_delay(poll, &self.probe).min(remaining)).await;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{ModelReference, Provider, RunId, RunKind, RunParameters};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Serves queued outcomes, then keeps repeating the last one.
    struct QueueBackend {
        calls: Mutex<VecDeque<Result<BackendReply, CallError>>>,
        health: Mutex<VecDeque<bool>>,
        call_count: Mutex<u32>,
    }

    impl QueueBackend {
        fn new(calls: Vec<Result<BackendReply, CallError>>, health: Vec<bool>) -> Self {
            Self {
                calls: Mutex::new(calls.into()),
                health: Mutex::new(health.into()),
                call_count: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for QueueBackend {
        async fn call(&self, _request: &RunRequest) -> Result<BackendReply, CallError> {
            *self.call_count.lock() += 1;
            let mut calls = self.calls.lock();
            if calls.len() > 1 {
                calls.pop_front().unwrap()
            } else {
                calls.front().cloned().unwrap()
            }
        }

        async fn health(&self) -> Result<(), CallError> {
            let mut health = self.health.lock();
            let healthy = if health.len() > 1 {
                health.pop_front().unwrap()
            } else {
                health.front().copied().unwrap_or(false)
            };
            if healthy {
                Ok(())
            } else {
                Err(CallError::Connection("starting".into()))
            }
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            run_id: RunId::from("t"),
            kind: RunKind::Chat,
            model: ModelReference::new("groq:m", Provider::Hosted),
            parameters: RunParameters::default(),
            prompt_text: "hi".into(),
            context_text: None,
            attached_file_refs: vec![],
            mitigation_attempt: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_connection_blips() {
        let backend = QueueBackend::new(
            vec![
                Err(CallError::Connection("refused".into())),
                Err(CallError::Connection("refused".into())),
                Ok(BackendReply::text("done")),
            ],
            vec![true],
        );
        let transport = ResilientTransport::new(backend);

        let started = Instant::now();
        let reply = transport.execute(&request()).await.unwrap();

        assert_eq!(reply.output, "done");
        assert_eq!(*transport.backend().call_count.lock(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_not_retried() {
        let backend = QueueBackend::new(vec![Err(CallError::remote(429, "rate limit"))], vec![true]);
        let transport = ResilientTransport::new(backend);

        let err = transport.execute(&request()).await.unwrap_err();

        assert_eq!(
            err,
            TransportError::Remote {
                status: 429,
                body: "rate limit".into(),
                retry_after: None,
            }
        );
        assert_eq!(*transport.backend().call_count.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let backend = QueueBackend::new(vec![Err(CallError::Connection("down".into()))], vec![]);
        let config = TransportConfig::default().with_max_attempts(3);
        let transport = ResilientTransport::with_config(backend, config, ProbeConfig::default());

        let err = transport.execute(&request()).await.unwrap_err();

        assert_eq!(
            err,
            TransportError::TransientNetwork {
                attempts: 3,
                last_error: "down".into(),
            }
        );
        assert_eq!(*transport.backend().call_count.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_succeeds_after_backoff() {
        let backend = QueueBackend::new(vec![Ok(BackendReply::default())], vec![false, false, true]);
        let transport = ResilientTransport::new(backend);

        let started = Instant::now();
        assert!(transport.probe_ready(Duration::from_secs(60)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_respects_deadline() {
        let backend = QueueBackend::new(vec![Ok(BackendReply::default())], vec![false]);
        let transport = ResilientTransport::new(backend);

        let started = Instant::now();
        assert!(!transport.probe_ready(Duration::from_millis(5_500)).await);
        assert_eq!(started.elapsed(), Duration::from_millis(5_500));
    }
}
