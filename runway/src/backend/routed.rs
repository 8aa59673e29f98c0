use async_trait::async_trait;

use super::{Backend, BackendReply, EchoBackend};
use crate::error::CallError;
use crate::run::RunRequest;

/// Model namespace served offline by [`EchoBackend`].
pub const STUB_NAMESPACE: &str = "stub";

/// Picks a backend per call from the model id's namespace.
///
/// `stub:*` models are answered locally; every other namespace goes to the
/// wrapped backend. Health reflects the wrapped backend only.
#[derive(Clone, Debug, Default)]
pub struct RoutedBackend<B> {
    stub: EchoBackend,
    default: B,
}

impl<B: Backend> RoutedBackend<B> {
    pub fn new(default: B) -> Self {
        Self {
            stub: EchoBackend::new(),
            default,
        }
    }

    pub fn inner(&self) -> &B {
        &self.default
    }
}

#[async_trait]
impl<B: Backend> Backend for RoutedBackend<B> {
    async fn call(&self, request: &RunRequest) -> Result<BackendReply, CallError> {
        let (namespace, model) = request.model.route();
        if namespace == STUB_NAMESPACE {
            tracing::debug!(run_id = %request.run_id, model = %model, "serving stub model locally");
            self.stub.call(request).await
        } else {
            self.default.call(request).await
        }
    }

    async fn health(&self) -> Result<(), CallError> {
        self.default.health().await
    }
}
