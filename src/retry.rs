//! Reconnect back-off and timeout utilities.
//!
//! The helpers in this module are transport-agnostic: they compute delays and
//! count attempts, while the stream worker owns the actual timers.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RealtimeDefaults;

/// Policy controlling automatic reconnects and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of automatic reconnects in one failure streak.
    pub max_attempts: u32,
    /// Base delay that is doubled once per attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Returns the policy used by the dashboard: 5 attempts, 1s base, 30s cap.
    pub fn dashboard() -> Self {
        Self {
            max_attempts: RealtimeDefaults::MAX_RECONNECT_ATTEMPTS,
            initial_backoff: RealtimeDefaults::INITIAL_BACKOFF,
            max_backoff: RealtimeDefaults::MAX_BACKOFF,
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based, so the first reconnect already waits twice the
    /// base delay: `min(initial_backoff * 2^attempt, max_backoff)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 0..attempt {
            if delay >= self.max_backoff {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        std::cmp::min(delay, self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::dashboard()
    }
}

/// Attempt counter for the current failure streak.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    /// Number of reconnects scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Starts a fresh streak.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Records an abnormal close and returns the delay before the next attempt.
    ///
    /// Returns `None` once the policy ceiling has been reached; the counter is
    /// left at the ceiling so later closes keep reporting exhaustion.
    pub fn next_delay(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        if self.attempts >= policy.max_attempts {
            warn!(
                event = "reconnect_exhausted",
                attempts = self.attempts,
                max_attempts = policy.max_attempts
            );
            return None;
        }

        self.attempts += 1;
        let delay = policy.delay_for_attempt(self.attempts);
        debug!(
            event = "reconnect_scheduled",
            attempt = self.attempts,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        Some(delay)
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
