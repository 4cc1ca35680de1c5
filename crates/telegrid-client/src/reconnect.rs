use std::time::Duration;

use telegrid_core::{Backoff, Jitter};

/// Client-side retry policy: capped exponential backoff, bounded attempts.
/// Unlike the ingestion bridge, a viewer gives up after the cap and waits
/// for its caller to ask for a reconnect.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(
                Duration::from_secs(1),
                Duration::from_secs(30),
                Jitter::Factor(0.2),
            ),
            max_attempts: 5,
        }
    }
}

/// The reconnect counters, kept apart from sockets and timers so the
/// schedule is testable as plain data.
#[derive(Clone, Debug, Default)]
pub struct ReconnectState {
    attempt: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed connect. Returns the delay before the next attempt,
    /// or `None` once the policy's attempt budget is spent.
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > policy.max_attempts {
            return None;
        }
        Some(policy.backoff.delay(self.attempt - 1))
    }

    /// A successful connect clears the counters.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
