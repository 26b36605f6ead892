use std::time::Duration;

use drishti_core::ReconnectConfig;

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_ms,
            max_ms,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay_ms, config.max_delay_ms, config.max_attempts)
    }

    /// `min(base * 2^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
