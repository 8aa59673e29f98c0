//! Classification of provider errors into corrective retry plans.
//!
//! The policy is a pure function of the error and the request that caused
//! it. It never touches run state; the orchestrator owns the budget and
//! applies the decision to its working copy of the request.

use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::MitigationConfig;
use crate::error::TransportError;
use crate::run::{RunParametersPatch, RunRequest};

/// Characters per token assumed by the estimator.
pub const CHARS_PER_TOKEN: usize = 4;

const CONTEXT_MARKERS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "context window",
    "maximum context",
    "too many tokens",
    "reduce the length",
    "prompt is too long",
    "maximum number of tokens",
];

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests"];

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "temporarily unavailable",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ContextLengthExceeded,
    RateLimited,
    TransientNetwork,
    Unclassified,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ContextLengthExceeded => "context_length_exceeded",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do about a failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct MitigationDecision {
    pub class: ErrorClass,
    pub should_retry: bool,
    pub delay_ms: u64,
    pub revised_prompt_text: Option<String>,
    pub revised_parameters: Option<RunParametersPatch>,
}

impl MitigationDecision {
    pub fn give_up(class: ErrorClass) -> Self {
        Self {
            class,
            should_retry: false,
            delay_ms: 0,
            revised_prompt_text: None,
            revised_parameters: None,
        }
    }

    pub fn retry_after(class: ErrorClass, delay_ms: u64) -> Self {
        Self {
            class,
            should_retry: true,
            delay_ms,
            revised_prompt_text: None,
            revised_parameters: None,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Derive the next working copy. The input request is left untouched.
    #[must_use]
    pub fn apply(&self, request: &RunRequest) -> RunRequest {
        let mut next = request.clone();
        if let Some(prompt) = &self.revised_prompt_text {
            next.prompt_text = prompt.clone();
        }
        if let Some(patch) = &self.revised_parameters {
            next.parameters = request.parameters.apply(patch);
        }
        next.mitigation_attempt = request.mitigation_attempt.saturating_add(1);
        next
    }
}

/// Decides whether and how a failed run is retried.
pub trait MitigationPolicy: Send + Sync {
    /// Must be deterministic: identical inputs give identical decisions.
    fn classify(&self, error: &TransportError, request: &RunRequest) -> MitigationDecision;

    /// Pre-flight check used before a call is attempted at all.
    fn is_likely_too_long(&self, text: &str, max_tokens: u32) -> bool;
}

/// Token estimate: characters / 4, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    estimate_tokens_for_chars(text.chars().count())
}

fn estimate_tokens_for_chars(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Bucket an error using its status code and message text.
pub fn classify_error(error: &TransportError) -> ErrorClass {
    if let TransportError::TransientNetwork { .. } = error {
        return ErrorClass::TransientNetwork;
    }

    let status = error.status();
    let message = error.message().to_ascii_lowercase();
    let mentions = |markers: &[&str]| markers.iter().any(|marker| message.contains(marker));

    if status == Some(413) || mentions(CONTEXT_MARKERS) {
        ErrorClass::ContextLengthExceeded
    } else if status == Some(429) || mentions(RATE_LIMIT_MARKERS) {
        ErrorClass::RateLimited
    } else if matches!(status, Some(503) | Some(504)) || mentions(TRANSIENT_MARKERS) {
        ErrorClass::TransientNetwork
    } else {
        ErrorClass::Unclassified
    }
}

/// Provider retry hint: the `Retry-After` header first, then phrases like
/// `try again in 1.5s`, `try again in 300ms` or `retry after 2 seconds`.
pub fn retry_hint(error: &TransportError) -> Option<Duration> {
    if let TransportError::Remote {
        retry_after: Some(after),
        ..
    } = error
    {
        return Some(*after);
    }

    let message = error.message().to_ascii_lowercase();
    ["try again in ", "retry after ", "retry in "]
        .iter()
        .find_map(|phrase| {
            let start = message.find(phrase)? + phrase.len();
            parse_duration_prefix(&message[start..])
        })
}

fn parse_duration_prefix(text: &str) -> Option<Duration> {
    let number_len = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let value: f64 = text[..number_len].parse().ok()?;
    let unit = text[number_len..].trim_start();

    let ms = if unit.starts_with("ms") || unit.starts_with("millisecond") {
        value
    } else if unit.starts_with("min") {
        value * 60_000.0
    } else {
        value * 1_000.0
    };

    (ms.is_finite() && ms >= 0.0).then(|| Duration::from_millis(ms.ceil() as u64))
}

fn truncate_chars(text: &str, keep: usize) -> String {
    text.chars().take(keep).collect()
}

/// The default policy: context-length trimming, rate-limit backoff and
/// transient-network retries.
#[derive(Clone, Debug, Default)]
pub struct StandardMitigationPolicy {
    config: MitigationConfig,
}

impl StandardMitigationPolicy {
    pub fn new(config: MitigationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MitigationConfig {
        &self.config
    }

    fn exceeds_margin(&self, tokens: usize, max_tokens: u32) -> bool {
        tokens as f64 > self.config.safety_margin * f64::from(max_tokens)
    }

    fn shrink_request(&self, request: &RunRequest) -> MitigationDecision {
        let class = ErrorClass::ContextLengthExceeded;
        let max_tokens = request.parameters.max_tokens;
        let prompt_chars = request.prompt_text.chars().count();
        let context_chars = request.content_chars() - prompt_chars;

        let mut decision =
            MitigationDecision::retry_after(class, self.config.context_retry_delay_ms);

        if self.exceeds_margin(estimate_tokens_for_chars(request.content_chars()), max_tokens) {
            let target_tokens = (f64::from(max_tokens) * self.config.truncate_ratio).floor() as usize;
            let budget_chars = (target_tokens * CHARS_PER_TOKEN).saturating_sub(context_chars);
            let keep = budget_chars
                .max(self.config.min_prompt_chars)
                .min(prompt_chars);
            if keep < prompt_chars {
                decision.revised_prompt_text = Some(truncate_chars(&request.prompt_text, keep));
            }
        }

        if decision.revised_prompt_text.is_none() && max_tokens > 1 {
            decision.revised_parameters = Some(RunParametersPatch {
                max_tokens: Some((max_tokens / 2).max(1)),
                ..Default::default()
            });
        }

        if decision.revised_prompt_text.is_none() && decision.revised_parameters.is_none() {
            return MitigationDecision::give_up(class);
        }
        decision
    }

    fn rate_limit_delay(&self, error: &TransportError, attempt: u32) -> u64 {
        if let Some(hint) = retry_hint(error) {
            return hint.as_millis().min(u128::from(u64::MAX)) as u64;
        }
        let exp = attempt.min(31) as i32;
        let scaled = (self.config.rate_limit_base_delay_ms as f64) * 2f64.powi(exp);
        scaled.min(self.config.rate_limit_max_delay_ms as f64) as u64
    }
}

impl MitigationPolicy for StandardMitigationPolicy {
    fn classify(&self, error: &TransportError, request: &RunRequest) -> MitigationDecision {
        match classify_error(error) {
            ErrorClass::ContextLengthExceeded => self.shrink_request(request),
            ErrorClass::RateLimited => MitigationDecision::retry_after(
                ErrorClass::RateLimited,
                self.rate_limit_delay(error, request.mitigation_attempt),
            ),
            ErrorClass::TransientNetwork => MitigationDecision::retry_after(
                ErrorClass::TransientNetwork,
                self.config.transient_retry_delay_ms,
            ),
            ErrorClass::Unclassified => MitigationDecision::give_up(ErrorClass::Unclassified),
        }
    }

    fn is_likely_too_long(&self, text: &str, max_tokens: u32) -> bool {
        self.exceeds_margin(estimate_tokens(text), max_tokens)
    }
}
