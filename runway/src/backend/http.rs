use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Backend, BackendReply};
use crate::error::CallError;
use crate::run::{RunParameters, RunRequest};

/// Talks to the studio backend over its REST API.
///
/// Calls go to `POST {base_url}/api/llm/chat`, the readiness probe to
/// `GET {base_url}/api/health`. Connection failures become
/// [`CallError::Connection`]; every answered non-2xx reply becomes
/// [`CallError::Remote`].
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ChatParams {
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

impl From<&RunParameters> for ChatParams {
    fn from(value: &RunParameters) -> Self {
        Self {
            max_tokens: value.max_tokens,
            temperature: value.temperature,
            top_p: value.top_p,
            top_k: value.top_k,
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model_id: &'a str,
    provider: &'a str,
    messages: Vec<ChatMessage<'a>>,
    params: ChatParams,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    output: String,
    #[serde(default)]
    raw: Option<RawReply>,
}

/// Provider payload passed through by the studio; only usage is read.
#[derive(Deserialize)]
struct RawReply {
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct TokenUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

impl ChatReply {
    fn into_reply(self) -> BackendReply {
        let mut reply = BackendReply::text(self.output);
        if let Some(usage) = self.raw.and_then(|raw| raw.usage) {
            let counts = [
                ("prompt_tokens", usage.prompt_tokens),
                ("completion_tokens", usage.completion_tokens),
                ("total_tokens", usage.total_tokens),
            ];
            for (key, count) in counts {
                if let Some(count) = count {
                    reply = reply.with_field(key, count as f64);
                }
            }
        }
        reply
    }
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn remote_error(resp: reqwest::Response) -> CallError {
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        CallError::Remote {
            status,
            body,
            retry_after,
        }
    }
}

/// A timeout after connecting may mean the call reached the model, so it is
/// not retried as a connection failure.
fn send_error(err: reqwest::Error) -> CallError {
    if err.is_connect() {
        CallError::Connection(err.to_string())
    } else if err.is_timeout() {
        CallError::Remote {
            status: 0,
            body: format!("request timed out: {err}"),
            retry_after: None,
        }
    } else if err.is_request() {
        CallError::Connection(err.to_string())
    } else {
        CallError::Remote {
            status: err.status().map_or(0, |status| status.as_u16()),
            body: err.to_string(),
            retry_after: None,
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self, request: &RunRequest) -> Result<BackendReply, CallError> {
        let body = ChatBody {
            model_id: &request.model.id,
            provider: request.model.provider.as_str(),
            messages: vec![ChatMessage {
                role: "user",
                content: request.content(),
            }],
            params: ChatParams::from(&request.parameters),
        };

        let resp = self
            .authorize(self.client.post(self.url("/api/llm/chat")).json(&body))
            .send()
            .await
            .map_err(send_error)?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }

        let status = resp.status().as_u16();
        let reply: ChatReply = resp.json().await.map_err(|err| CallError::Remote {
            status,
            body: format!("malformed reply: {err}"),
            retry_after: None,
        })?;

        Ok(reply.into_reply())
    }

    async fn health(&self) -> Result<(), CallError> {
        let resp = self
            .client
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(send_error)?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::remote_error(resp).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::run::{ModelReference, Provider, ResultValue, RunId, RunKind};

    fn request() -> RunRequest {
        RunRequest {
            run_id: RunId::from("http"),
            kind: RunKind::Chat,
            model: ModelReference::new("groq:llama-3.1-8b-instant", Provider::Hosted),
            parameters: RunParameters::default(),
            prompt_text: "hello".into(),
            context_text: None,
            attached_file_refs: vec![],
            mitigation_attempt: 0,
        }
    }

    /// Read one request: headers plus a `Content-Length` body.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.expect("read request");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serve a single canned response and hand back the raw request text.
    async fn serve_once(
        status: &'static str,
        headers: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let seen = read_request(&mut stream).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.expect("write response");
            stream.shutdown().await.ok();
            seen
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend = HttpBackend::new("http://127.0.0.1:8000/");
        assert_eq!(backend.url("/api/health"), "http://127.0.0.1:8000/api/health");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        // Port 9 (discard) is closed on loopback in any sane test environment.
        let backend = HttpBackend::new("http://127.0.0.1:9");
        let err = backend.health().await.unwrap_err();
        assert!(matches!(err, CallError::Connection(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_reply_carries_output_and_token_usage() {
        let (url, server) = serve_once(
            "200 OK",
            "",
            r#"{"output":"hi there","raw":{"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}}"#,
        )
        .await;

        let reply = HttpBackend::new(url).call(&request()).await.unwrap();
        let seen = server.await.unwrap();

        assert_eq!(reply.output, "hi there");
        assert_eq!(reply.fields.get("prompt_tokens"), Some(&ResultValue::Number(12.0)));
        assert_eq!(reply.fields.get("completion_tokens"), Some(&ResultValue::Number(3.0)));
        assert_eq!(reply.fields.get("total_tokens"), Some(&ResultValue::Number(15.0)));
        assert!(seen.starts_with("POST /api/llm/chat "), "{seen}");
        assert!(seen.contains(r#""model_id":"groq:llama-3.1-8b-instant""#), "{seen}");
        assert!(seen.contains(r#""max_tokens":512"#), "{seen}");
    }

    #[tokio::test]
    async fn test_reply_without_usage_has_no_token_fields() {
        let (url, server) = serve_once("200 OK", "", r#"{"output":"plain"}"#).await;

        let reply = HttpBackend::new(url).call(&request()).await.unwrap();
        server.await.unwrap();

        assert_eq!(reply.output, "plain");
        assert!(reply.fields.is_empty());
    }

    #[tokio::test]
    async fn test_non_success_is_remote_with_retry_after() {
        let (url, server) = serve_once(
            "429 Too Many Requests",
            "Retry-After: 7\r\n",
            r#"{"detail":"rate limit reached"}"#,
        )
        .await;

        let err = HttpBackend::new(url).call(&request()).await.unwrap_err();
        server.await.unwrap();

        match err {
            CallError::Remote {
                status,
                body,
                retry_after,
            } => {
                assert_eq!(status, 429);
                assert!(body.contains("rate limit reached"));
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_remote_without_hint() {
        let (url, server) = serve_once("502 Bad Gateway", "", r#"{"detail":"upstream"}"#).await;

        let err = HttpBackend::new(url).health().await.unwrap_err();
        let seen = server.await.unwrap();

        assert!(seen.starts_with("GET /api/health "), "{seen}");
        assert!(matches!(
            err,
            CallError::Remote { status: 502, retry_after: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_after_send_is_not_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            read_request(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let err = HttpBackend::with_client(client, format!("http://{addr}"))
            .call(&request())
            .await
            .unwrap_err();
        server.abort();

        match err {
            CallError::Remote { status, body, .. } => {
                assert_eq!(status, 0);
                assert!(body.contains("timed out"), "{body}");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
