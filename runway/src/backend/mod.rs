/// Offline backend for the studio's `stub` model namespace.
pub mod echo;
#[cfg(feature = "http")]
/// Client for the studio REST API.
pub mod http;
/// Namespace dispatch between the stub and a real backend.
pub mod routed;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CallError;
use crate::run::{ResultValue, RunRequest, RunResult};

pub use echo::EchoBackend;
#[cfg(feature = "http")]
pub use http::HttpBackend;
pub use routed::{RoutedBackend, STUB_NAMESPACE};

/// What a successful model call returns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendReply {
    /// Generated text.
    pub output: String,
    /// Extra result fields reported by the backend (scores, token usage).
    pub fields: RunResult,
}

impl BackendReply {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            fields: RunResult::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<ResultValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// The opaque inference boundary.
///
/// Implementations perform exactly one call per invocation; retrying is the
/// transport's job.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one model call.
    async fn call(&self, request: &RunRequest) -> Result<BackendReply, CallError>;

    /// Liveness check. `Ok` only when the backend can serve real traffic.
    async fn health(&self) -> Result<(), CallError>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn call(&self, request: &RunRequest) -> Result<BackendReply, CallError> {
        (**self).call(request).await
    }

    async fn health(&self) -> Result<(), CallError> {
        (**self).health().await
    }
}
