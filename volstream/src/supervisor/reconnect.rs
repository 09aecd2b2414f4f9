use super::state::ConnectionTracker;
use crate::{config::FeedConfig, transport::CLOSE_CODE_NORMAL};
use std::time::Duration;

/// Outcome of consulting the [`ReconnectPolicy`] after a connection ended.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReconnectDecision {
    /// Clean close, do not reconnect.
    Stop,
    RetryAfter(Duration),
    /// Attempts exhausted, the feed is unavailable.
    Exhausted,
}

/// Exponential backoff reconnect policy: `min(2^attempts, cap)` seconds, for at most
/// `max_attempts` consecutive attempts.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_cap: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, backoff_cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff_cap,
        }
    }

    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let secs = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.backoff_cap)
    }

    /// Decide how to proceed once the tracked connection is `Disconnected`, recording the
    /// attempt on the tracker when a retry is scheduled.
    pub fn decide(&self, tracker: &mut ConnectionTracker) -> ReconnectDecision {
        if tracker.last_close_code() == Some(CLOSE_CODE_NORMAL) {
            tracker.reset_attempts();
            return ReconnectDecision::Stop;
        }

        let attempts = tracker.reconnect_attempts();
        if attempts < self.max_attempts {
            tracker.record_attempt();
            ReconnectDecision::RetryAfter(self.delay_for_attempt(attempts))
        } else {
            ReconnectDecision::Exhausted
        }
    }
}

impl From<&FeedConfig> for ReconnectPolicy {
    fn from(config: &FeedConfig) -> Self {
        Self::new(config.max_reconnect_attempts, config.backoff_cap)
    }
}
