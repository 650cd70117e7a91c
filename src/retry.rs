//! Retry decisions and exponential backoff.

use std::time::Duration;

use crate::error::FetchError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub backoff_base: Duration,
  pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: DEFAULT_MAX_RETRIES,
      backoff_base: DEFAULT_BACKOFF_BASE,
      backoff_cap: DEFAULT_BACKOFF_CAP,
    }
  }
}

impl RetryPolicy {
  /// A policy that surfaces every failure on the first attempt.
  pub fn never() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Retry iff the error class permits it and fewer than `max_retries` retries
  /// have been made for the current fetch.
  pub fn should_retry(&self, error: &FetchError, retry_count: u32) -> bool {
    error.class().is_retryable() && retry_count < self.max_retries
  }

  /// Delay before retry `attempt` (0-indexed): `min(base * 2^attempt, cap)`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    2u32
      .checked_pow(attempt)
      .and_then(|factor| self.backoff_base.checked_mul(factor))
      .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
  }
}
