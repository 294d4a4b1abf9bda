//! Upstream Reconnect Backoff
//!
//! When an upstream stream fails while members are still attached, the
//! fan-out reopens it after a delay that doubles per consecutive failure:
//!
//! ```text
//!   failure 1 ─▶ wait 50ms
//!   failure 2 ─▶ wait 100ms
//!   failure 3 ─▶ wait 200ms
//!   failure 4 ─▶ wait 400ms
//!   ...          capped at the configured reconnect delay
//! ```
//!
//! The first WINDOW on a reopened upstream resets the attempt counter.
//!
//! ## Terminal errors
//!
//! `NOT_LEADER_OR_FOLLOWER` (6) is never retried: leadership moved and the
//! members have to resolve the new leader themselves.

use std::time::Duration;

use streamgate_core::ErrorCode;

/// Delay before the first reconnect attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    max_backoff: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// A zero `max_backoff` disables reconnects.
    pub fn new(max_backoff: Duration) -> Self {
        Self {
            max_backoff,
            attempt: 0,
        }
    }

    pub fn from_secs(max_backoff_secs: u64) -> Self {
        Self::new(Duration::from_secs(max_backoff_secs))
    }

    pub fn is_enabled(&self) -> bool {
        !self.max_backoff.is_zero()
    }

    /// Backoff for the given attempt: min(50ms << attempt, max_backoff).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shifted = INITIAL_BACKOFF
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);
        shifted.min(self.max_backoff)
    }

    /// Delay for the next attempt, counting it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether an upstream RESET with this error may be retried.
    pub fn is_retryable(&self, error: i16) -> bool {
        self.is_enabled() && error != ErrorCode::NotLeaderOrFollower.as_i16()
    }
}
