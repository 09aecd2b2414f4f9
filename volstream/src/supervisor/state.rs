use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of the single upstream feed connection.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, Deserialize, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Closing,
}

/// Input driving a [`ConnectionTracker`] transition.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionEvent {
    Connect,
    Connected,
    Authenticated,
    SubscriptionsConfirmed,
    /// Connection ended, with the close code if a close frame was received.
    Closed(Option<u16>),
    Shutdown,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
#[error("invalid connection transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

/// Owns the [`ConnectionState`] together with the reconnect bookkeeping.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ConnectionTracker {
    state: ConnectionState,
    reconnect_attempts: u32,
    last_close_code: Option<u16>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_close_code(&self) -> Option<u16> {
        self.last_close_code
    }

    /// Apply `event`, returning the new [`ConnectionState`].
    ///
    /// Entering [`ConnectionState::Streaming`] is the only transition that resets the reconnect
    /// counter.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, TransitionError> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        let next = match (self.state, event) {
            (Disconnected, Connect) => {
                self.last_close_code = None;
                Connecting
            }
            (Connecting, Connected) => Authenticating,
            (Authenticating, Authenticated) => Subscribing,
            (Subscribing, SubscriptionsConfirmed) => {
                self.reconnect_attempts = 0;
                Streaming
            }
            (Disconnected, Closed(_)) => Disconnected,
            (_, Closed(code)) => {
                self.last_close_code = code;
                Disconnected
            }
            (Disconnected | Closing, Shutdown) => self.state,
            (_, Shutdown) => Closing,
            (from, event) => return Err(TransitionError { from, event }),
        };

        self.state = next;
        Ok(next)
    }

    pub(crate) fn record_attempt(&mut self) {
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
    }

    pub(crate) fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }
}

/// Operator facing feed status, published over a `tokio::sync::watch` channel.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Deserialize, Serialize)]
pub enum FeedStatus {
    #[display("{state} (reconnect attempts: {reconnect_attempts})")]
    Connection {
        state: ConnectionState,
        reconnect_attempts: u32,
    },
    #[display("rate limited until {until}")]
    RateLimited { until: DateTime<Utc> },
    #[display("unavailable after {attempts} reconnect attempts")]
    Unavailable { attempts: u32 },
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::from(&ConnectionTracker::default())
    }
}

impl From<&ConnectionTracker> for FeedStatus {
    fn from(tracker: &ConnectionTracker) -> Self {
        Self::Connection {
            state: tracker.state(),
            reconnect_attempts: tracker.reconnect_attempts(),
        }
    }
}
