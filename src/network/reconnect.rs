//! Reconnect policies.
//!
//! After a session drops, the connection asks its policy how long to
//! wait before the next attempt.  Returning `None` gives up and
//! leaves the connection disconnected.  Attempts are counted from 1
//! and reset once a session has been established.

use std::time::Duration;

use crate::config::ReconnectSection;

pub trait ReconnectPolicy: Send + Sync {
    /// Delay before attempt number `attempt`, or `None` to stop.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff: the delay doubles per attempt, starting at
/// `initial` and capped at `max`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    /// Zero retries forever.
    max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
        }
    }
}

impl From<&ReconnectSection> for Backoff {
    fn from(section: &ReconnectSection) -> Self {
        Backoff::new(
            Duration::from_millis(section.initial_delay_ms),
            Duration::from_millis(section.max_delay_ms),
            section.max_attempts,
        )
    }
}

impl ReconnectPolicy for Backoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts != 0 && attempt > self.max_attempts {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.initial.saturating_mul(1u32 << shift);
        Some(delay.min(self.max))
    }
}

/// Never reconnect.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}
