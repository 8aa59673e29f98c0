use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;

use crate::backend::Backend;
use crate::config::RunwayConfig;
use crate::events::{RunEventBus, RunEventPublisher};
use crate::history::HistorySink;
use crate::mitigation::{MitigationPolicy, StandardMitigationPolicy};
use crate::progress::ProgressPublisher;
use crate::transport::{ResilientTransport, Transport};

use super::supervisor::JobOrchestrator;
use super::worker::Services;

/// Builder for a [`JobOrchestrator`].
///
/// A transport is required, either directly through
/// [`with_transport`](Self::with_transport) or by wrapping a backend with
/// [`with_backend`](Self::with_backend). Everything else falls back to a
/// default built from the config: the standard mitigation policy, a fresh
/// progress publisher, and an event bus nobody listens to.
///
/// ```ignore
/// let events = Arc::new(RunEventBus::new(256));
/// let orchestrator = OrchestratorBuilder::new(RunwayConfig::default())
///     .with_backend(EchoBackend::new())
///     .with_events(events.clone())
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    config: RunwayConfig,
    transport: Option<Arc<dyn Transport>>,
    policy: Option<Arc<dyn MitigationPolicy>>,
    publisher: Option<ProgressPublisher>,
    events: Option<Arc<dyn RunEventPublisher>>,
    history: Option<Arc<dyn HistorySink>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("transport_set", &self.transport.is_some())
            .field("policy_set", &self.policy.is_some())
            .field("publisher_set", &self.publisher.is_some())
            .field("events_set", &self.events.is_some())
            .field("history_set", &self.history.is_some())
            .finish()
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new(RunwayConfig::default())
    }
}

impl OrchestratorBuilder {
    pub fn new(config: RunwayConfig) -> Self {
        Self {
            config,
            transport: None,
            policy: None,
            publisher: None,
            events: None,
            history: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Wrap `backend` in a [`ResilientTransport`] configured from the
    /// builder's transport and probe sections.
    pub fn with_backend<B: Backend + 'static>(mut self, backend: B) -> Self {
        let transport = ResilientTransport::with_config(
            backend,
            self.config.transport.clone(),
            self.config.probe.clone(),
        );
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn MitigationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Share an existing publisher so callers can subscribe before any job
    /// is submitted.
    pub fn with_publisher(mut self, publisher: ProgressPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn RunEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn build(self) -> anyhow::Result<JobOrchestrator> {
        self.config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| anyhow!("transport dependency missing"))?;
        let policy = self.policy.unwrap_or_else(|| {
            Arc::new(StandardMitigationPolicy::new(self.config.mitigation.clone()))
        });
        let events = self.events.unwrap_or_else(|| {
            Arc::new(RunEventBus::new(self.config.orchestrator.event_capacity))
        });

        Ok(JobOrchestrator::new(Services {
            transport,
            policy,
            publisher: self.publisher.unwrap_or_default(),
            events,
            history: self.history,
            config: self.config.orchestrator,
        }))
    }
}
