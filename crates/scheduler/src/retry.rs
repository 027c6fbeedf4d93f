use std::time::Duration;

use chatlog_core::SchedulerConfig;
use rand::Rng;

/// Exponential backoff without jitter unless explicitly configured.
///
/// Every execution failure and timeout counts as retryable; only the
/// attempt budget decides.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay randomly added or removed (0.0 = off).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, jitter: 0.0 }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.retry_base(), config.retry_cap()).with_jitter(config.retry_jitter)
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// `min(base * 2^attempt, cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Decide whether a task that has already been retried `attempt` times
    /// gets another attempt, and how long to wait before it.
    pub fn should_retry(&self, attempt: u32, max_retries: u32) -> (bool, Duration) {
        if attempt >= max_retries {
            return (false, Duration::ZERO);
        }
        let delay = self.backoff(attempt);
        if self.jitter > 0.0 {
            (true, self.jittered(delay))
        } else {
            (true, delay)
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread).min(self.cap)
    }
}
