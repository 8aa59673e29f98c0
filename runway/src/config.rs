use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Retry behavior of the resilient transport for connection-level failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
    /// Delays before the first retries, in order.
    pub initial_delays_ms: Vec<u64>,
    /// Growth applied to the last fixed delay for every later retry.
    pub growth_factor: f64,
    /// Ceiling for any single retry delay.
    pub max_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delays_ms: vec![200, 400],
            growth_factor: 1.5,
            max_delay_ms: 8_000,
        }
    }
}

impl TransportConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delays(mut self, delays_ms: Vec<u64>) -> Self {
        self.initial_delays_ms = delays_ms;
        self
    }

    pub fn with_max_delay(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }
}

/// Readiness probe polling schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
        }
    }
}

/// Thresholds and delays used by the mitigation policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MitigationConfig {
    /// Estimated prompt tokens above this fraction of `max_tokens` count as
    /// the likely cause of a context-length failure.
    pub safety_margin: f64,
    /// Truncated content is sized to this fraction of `max_tokens`.
    pub truncate_ratio: f64,
    /// Truncation never shortens the prompt below this many characters.
    pub min_prompt_chars: usize,
    pub context_retry_delay_ms: u64,
    pub transient_retry_delay_ms: u64,
    pub rate_limit_base_delay_ms: u64,
    pub rate_limit_max_delay_ms: u64,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            safety_margin: 0.9,
            truncate_ratio: 0.75,
            min_prompt_chars: 64,
            context_retry_delay_ms: 250,
            transient_retry_delay_ms: 500,
            rate_limit_base_delay_ms: 1_000,
            rate_limit_max_delay_ms: 30_000,
        }
    }
}

/// Per-job execution settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Mitigated retries allowed per run.
    pub retry_budget: u32,
    /// Probe backend readiness before a job's first call.
    pub probe_before_start: bool,
    pub probe_deadline_ms: u64,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            probe_before_start: true,
            probe_deadline_ms: 30_000,
            event_capacity: 1_024,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn with_probe(mut self, enabled: bool, deadline_ms: u64) -> Self {
        self.probe_before_start = enabled;
        self.probe_deadline_ms = deadline_ms;
        self
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_millis(self.probe_deadline_ms)
    }
}

/// Top-level configuration, loadable from JSON. Every section and field is
/// optional in the file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunwayConfig {
    pub transport: TransportConfig,
    pub probe: ProbeConfig,
    pub mitigation: MitigationConfig,
    pub orchestrator: OrchestratorConfig,
}

impl RunwayConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), "runway config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_attempts must be at least 1".into(),
            ));
        }
        if self.transport.growth_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "transport.growth_factor must be >= 1".into(),
            ));
        }
        for (name, ratio) in [
            ("mitigation.safety_margin", self.mitigation.safety_margin),
            ("mitigation.truncate_ratio", self.mitigation.truncate_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in (0, 1], got {ratio}"
                )));
            }
        }
        if self.probe.base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "probe.base_delay_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        RunwayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RunwayConfig::from_json_str(
            r#"{ "transport": { "max_attempts": 3 }, "orchestrator": { "retry_budget": 1 } }"#,
        )
        .unwrap();

        assert_eq!(config.transport.max_attempts, 3);
        assert_eq!(config.transport.initial_delays_ms, vec![200, 400]);
        assert_eq!(config.orchestrator.retry_budget, 1);
        assert!(config.orchestrator.probe_before_start);
        assert_eq!(config.mitigation, MitigationConfig::default());
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let err = RunwayConfig::from_json_str(r#"{ "mitigation": { "truncate_ratio": 1.5 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("truncate_ratio")));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = RunwayConfig::from_json_str(r#"{ "transport": { "max_attempts": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunwayConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
