use std::time::Duration;

use crate::config::{ProbeConfig, TransportConfig};

/// Delay before retry number `retry` (1-based) of a connection failure.
///
/// The first retries use the fixed `initial_delays_ms`; later ones grow the
/// last fixed delay by `growth_factor` per step, capped at `max_delay_ms`.
pub fn retry_delay(retry: u32, config: &TransportConfig) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }

    let fixed = &config.initial_delays_ms;
    let index = (retry - 1) as usize;
    let ms = match fixed.get(index) {
        Some(ms) => (*ms).min(config.max_delay_ms),
        None => {
            let last = fixed.last().copied().unwrap_or(config.max_delay_ms);
            let steps = (index + 1 - fixed.len()) as i32;
            let scaled = (last as f64) * config.growth_factor.powi(steps);
            scaled.min(config.max_delay_ms as f64).max(0.0) as u64
        }
    };

    Duration::from_millis(ms)
}

/// Delay after failed readiness poll number `poll` (1-based).
///
/// Formula: min(base * 2^(poll - 1), max)
pub fn probe_delay(poll: u32, config: &ProbeConfig) -> Duration {
    if poll == 0 {
        return Duration::ZERO;
    }

    let exp = poll.saturating_sub(1).min(32) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_delay_ms as f64);

    Duration::from_millis(capped.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(retry: u32, config: &TransportConfig) -> u64 {
        retry_delay(retry, config).as_millis() as u64
    }

    #[test]
    fn test_retry_delay_schedule() {
        let config = TransportConfig::default();
        let delays: Vec<u64> = (1..=7).map(|retry| ms(retry, &config)).collect();
        assert_eq!(delays, vec![200, 400, 600, 900, 1350, 2025, 3037]);
    }

    #[test]
    fn test_retry_delay_capped() {
        let config = TransportConfig::default();
        assert_eq!(ms(30, &config), config.max_delay_ms);
    }

    #[test]
    fn test_retry_delay_non_decreasing() {
        let config = TransportConfig::default();
        let mut previous = 0;
        for retry in 1..40 {
            let current = ms(retry, &config);
            assert!(current >= previous, "retry {retry}: {current} < {previous}");
            previous = current;
        }
    }

    #[test]
    fn test_retry_delay_without_fixed_prefix() {
        let config = TransportConfig::default().with_initial_delays(vec![]);
        assert_eq!(ms(1, &config), config.max_delay_ms);
    }

    #[test]
    fn test_probe_delay_exponential_and_capped() {
        let config = ProbeConfig::default();
        let delays: Vec<u64> = (1..=6)
            .map(|poll| probe_delay(poll, &config).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 16_000]);
    }
}
