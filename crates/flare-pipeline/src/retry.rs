use flare_core::config::DeliveryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff for retryable delivery failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay(),
            max_delay: config.max_retry_delay(),
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    pub fn no_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Whether a payload that has been attempted `attempts` times may go again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let jitter = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(factor).min(self.max_delay)
    }
}
