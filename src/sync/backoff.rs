//! Exponential retry delay for transient sync failures.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::queue::{OperationStatus, QueuedOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub base: Duration,
  pub cap: Duration,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(2),
      cap: Duration::from_secs(300),
    }
  }
}

impl Backoff {
  /// Delay after the given number of failed attempts.
  pub fn delay_for(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let exponent = (attempts - 1).min(31);
    self
      .base
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.cap)
      .min(self.cap)
  }

  /// Whether a retrying operation has waited long enough.
  pub fn is_ready(&self, op: &QueuedOperation, now: DateTime<Utc>) -> bool {
    if op.status != OperationStatus::Retrying {
      return true;
    }
    let Some(last) = op.last_attempt_at else {
      return true;
    };
    let delay = chrono::Duration::from_std(self.delay_for(op.attempts))
      .unwrap_or_else(|_| chrono::Duration::MAX);
    now.signed_duration_since(last) >= delay
  }
}
