use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with a ceiling: `min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  base: Duration,
  cap: Duration,
}

impl Backoff {
  pub fn new(base: Duration, cap: Duration) -> Self {
    Self {
      base,
      cap: cap.max(base),
    }
  }

  pub fn from_config(config: &RetryConfig) -> Self {
    Self::new(
      Duration::from_millis(config.base_wait_ms),
      Duration::from_millis(config.cap_wait_ms),
    )
  }

  /// Delay before the attempt following `n` consecutive failures.
  pub fn delay(&self, n: u32) -> Duration {
    2u32
      .checked_pow(n)
      .and_then(|factor| self.base.checked_mul(factor))
      .map_or(self.cap, |d| d.min(self.cap))
  }

  pub fn cap(&self) -> Duration {
    self.cap
  }
}
