use async_trait::async_trait;

use super::{Backend, BackendReply};
use crate::error::CallError;
use crate::run::RunRequest;

const ECHO_PREFIX: &str = "[STUB ECHO]\n";
const ECHO_LIMIT_CHARS: usize = 4_000;

/// Answers every call by echoing the request content back.
///
/// Lets a job run end to end without a model server, the same way the studio
/// serves `stub:echo` when no provider key is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoBackend;

impl EchoBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for EchoBackend {
    async fn call(&self, request: &RunRequest) -> Result<BackendReply, CallError> {
        let content: String = request.content().chars().take(ECHO_LIMIT_CHARS).collect();
        let chars = content.chars().count() as f64;
        Ok(BackendReply::text(format!("{ECHO_PREFIX}{content}")).with_field("echoed_chars", chars))
    }

    async fn health(&self) -> Result<(), CallError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{ModelReference, Provider, ResultValue, RunId, RunKind, RunParameters};

    fn request(prompt: String) -> RunRequest {
        RunRequest {
            run_id: RunId::from("echo"),
            kind: RunKind::Prompt,
            model: ModelReference::new("stub:echo", Provider::Local),
            parameters: RunParameters::default(),
            prompt_text: prompt,
            context_text: None,
            attached_file_refs: vec![],
            mitigation_attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_echo_prefixes_content() {
        let reply = EchoBackend.call(&request("hi".into())).await.unwrap();
        assert_eq!(reply.output, "[STUB ECHO]\nhi");
        assert_eq!(reply.fields.get("echoed_chars"), Some(&ResultValue::Number(2.0)));
    }

    #[tokio::test]
    async fn test_echo_truncates_long_content() {
        let reply = EchoBackend.call(&request("x".repeat(5_000))).await.unwrap();
        assert_eq!(reply.output.chars().count(), ECHO_PREFIX.len() + ECHO_LIMIT_CHARS);
        assert!(EchoBackend.health().await.is_ok());
    }
}
