//! Exponential backoff for task retries and transport errors

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000, // 1 minute
            multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// `initial_delay_ms * multiplier^(attempt - 1)`, capped at `max_delay_ms`,
    /// with symmetric jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);
        Duration::from_millis(self.jitter(capped_delay))
    }

    fn jitter(&self, delay: f64) -> u64 {
        // Apply jitter only if jitter_factor > 0
        if self.jitter_factor > 0.0 && delay > 0.0 {
            let jitter_range = delay * self.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (delay + jitter).max(1.0) as u64
        } else {
            delay.max(1.0) as u64
        }
    }
}

/// Stateful exponential backoff, reset after a success
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with custom configuration
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        self.config.delay_for_attempt(self.attempt)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::with_config(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter_factor: 0.0, // No jitter for predictable testing
        }
    }

    #[test]
    fn test_delay_for_attempt_grows_and_caps() {
        let config = no_jitter();

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = BackoffConfig {
            jitter_factor: 0.5,
            ..no_jitter()
        };

        for _ in 0..100 {
            let delay = config.delay_for_attempt(2).as_millis();
            assert!((100..=300).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_stateful_backoff_reset() {
        let mut backoff = ExponentialBackoff::with_config(no_jitter());

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
