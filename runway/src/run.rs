use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a run, unique within its job.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Ocr,
    Prompt,
    Chat,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Ocr => "ocr",
            RunKind::Prompt => "prompt",
            RunKind::Chat => "chat",
        }
    }
}

impl Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Hosted,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Hosted => "hosted",
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace assumed for model ids without a `ns:` prefix.
pub const DEFAULT_MODEL_NAMESPACE: &str = "groq";

/// Which backend and model serve a run.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ModelReference {
    pub id: String,
    pub provider: Provider,
}

impl ModelReference {
    pub fn new(id: impl Into<String>, provider: Provider) -> Self {
        Self {
            id: id.into(),
            provider,
        }
    }

    /// Split `"groq:mixtral-8x7b"` into `("groq", "mixtral-8x7b")`.
    pub fn route(&self) -> (&str, &str) {
        match self.id.split_once(':') {
            Some((namespace, model)) => (namespace, model),
            None => (DEFAULT_MODEL_NAMESPACE, self.id.as_str()),
        }
    }
}

/// Numeric knobs forwarded to the model call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParameters {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 512,
            top_p: 1.0,
            top_k: 0,
        }
    }
}

impl RunParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidParameter {
                field: "temperature",
                reason: format!("{} is outside [0, 2]", self.temperature),
            });
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::InvalidParameter {
                field: "maxTokens",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ConfigError::InvalidParameter {
                field: "topP",
                reason: format!("{} is outside [0, 1]", self.top_p),
            });
        }
        Ok(())
    }

    /// Return a copy with every field set in `patch` replaced.
    #[must_use]
    pub fn apply(&self, patch: &RunParametersPatch) -> Self {
        Self {
            temperature: patch.temperature.unwrap_or(self.temperature),
            max_tokens: patch.max_tokens.unwrap_or(self.max_tokens),
            top_p: patch.top_p.unwrap_or(self.top_p),
            top_k: patch.top_k.unwrap_or(self.top_k),
        }
    }
}

/// Partial override of [`RunParameters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParametersPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl RunParametersPatch {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.max_tokens.is_none()
            && self.top_p.is_none()
            && self.top_k.is_none()
    }
}

/// A single value in a run result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Number(f64),
    Text(String),
}

impl From<f64> for ResultValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for ResultValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ResultValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

pub type RunResult = BTreeMap<String, ResultValue>;

/// What the UI asked to execute. Never modified after submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub id: RunId,
    pub name: String,
    pub kind: RunKind,
    pub model: ModelReference,
    pub parameters: RunParameters,
    pub prompt_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
    #[serde(default)]
    pub attached_file_refs: Vec<String>,
    #[serde(default)]
    pub requested_metrics: BTreeSet<String>,
}

impl RunConfig {
    /// The initial working copy sent to the transport.
    pub fn request(&self) -> RunRequest {
        RunRequest {
            run_id: self.id.clone(),
            kind: self.kind,
            model: self.model.clone(),
            parameters: self.parameters,
            prompt_text: self.prompt_text.clone(),
            context_text: self.context_text.clone(),
            attached_file_refs: self.attached_file_refs.clone(),
            mitigation_attempt: 0,
        }
    }
}

/// A user-submitted batch of runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub runs: Vec<RunConfig>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runs: Vec::new(),
        }
    }

    pub fn with_run(mut self, run: RunConfig) -> Self {
        self.runs.push(run);
        self
    }
}

/// The request as actually sent, possibly revised by mitigation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub run_id: RunId,
    pub kind: RunKind,
    pub model: ModelReference,
    pub parameters: RunParameters,
    pub prompt_text: String,
    pub context_text: Option<String>,
    pub attached_file_refs: Vec<String>,
    /// Number of mitigations already applied to reach this request.
    pub mitigation_attempt: u32,
}

impl RunRequest {
    /// Context and prompt as one message body, context first.
    pub fn content(&self) -> String {
        match self.context_text.as_deref() {
            Some(context) if !context.is_empty() => {
                format!("{context}\n\n{}", self.prompt_text)
            }
            _ => self.prompt_text.clone(),
        }
    }

    /// Character count of prompt plus context.
    pub fn content_chars(&self) -> usize {
        self.prompt_text.chars().count()
            + self
                .context_text
                .as_deref()
                .map_or(0, |context| context.chars().count())
    }
}
