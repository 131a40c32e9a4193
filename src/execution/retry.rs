use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between submission attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}
