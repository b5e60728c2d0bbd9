//! Exponential backoff for tunnel reconnection

use std::time::Duration;

use tether_core::config::BackoffConfig;

/// Attempt-indexed exponential backoff with jitter.
///
/// The deterministic part is `min(base · 2^attempt, max)`; the actual
/// delay adds 0 to `jitter` of that on top, so concurrent daemons do not
/// reconnect in lockstep.
pub struct ReconnectBackoff {
    /// Base delay in milliseconds (attempt 0)
    base_ms: u64,
    /// Delay cap in milliseconds
    max_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ReconnectBackoff {
    /// Create a backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            max_ms: config.max_delay_ms,
            jitter: config.jitter,
        }
    }

    /// Create a backoff with custom parameters
    pub fn new(base_ms: u64, max_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter,
        }
    }

    /// The deterministic delay for an attempt, before jitter
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let exp = if attempt >= 32 {
            self.max_ms
        } else {
            (self.base_ms.saturating_mul(1u64 << attempt)).min(self.max_ms)
        };
        Duration::from_millis(exp)
    }

    /// The actual delay for an attempt: exponential plus 0 to `jitter`
    /// of itself
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.exponential_delay(attempt);
        let jitter_amount = exp.as_secs_f64() * self.jitter * rand::random::<f64>();
        exp + Duration::from_secs_f64(jitter_amount)
    }
}
