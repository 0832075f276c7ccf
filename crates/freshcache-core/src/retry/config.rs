use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Upper bound on the backoff delay, before jitter.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Random extra delay so clients that failed together don't retry together.
pub const DEFAULT_JITTER_MS: u64 = 1000;

/// Backoff schedule for retried operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
            jitter_ms: 0,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_ms = jitter.as_millis() as u64;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    /// Total invocations an operation gets, first attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before the retry that follows failed attempt `attempt`
    /// (0-based), without jitter: `min(base * factor^attempt, max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let max = self.max_delay_ms as f64;
        let capped = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) plus up to `jitter_ms`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        delay + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(30));
        assert_eq!(config.backoff_factor, 2.0);
        assert_eq!(config.max_attempts(), 4);
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::new(20).with_max_delay(Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_is_monotonic() {
        let config = RetryConfig::new(10).with_backoff_factor(1.5);
        let delays: Vec<Duration> = (0..12).map(|a| config.delay_for_attempt(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..5 {
            let base = config.delay_for_attempt(attempt);
            for _ in 0..50 {
                let delay = config.jittered_delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base + config.jitter());
            }
        }
    }

    #[test]
    fn test_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.jittered_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, DEFAULT_BASE_DELAY_MS);
    }
}
