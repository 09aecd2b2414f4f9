use crate::error::TransportError;
use async_trait::async_trait;
use url::Url;

/// Idle read timeout wrapper for the WebSocket read half.
pub mod timeout;

/// [`Transport`] over `tokio-tungstenite`.
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

pub use websocket::WebSocketTransport;

/// WebSocket close code of a clean, intentional close.
pub const CLOSE_CODE_NORMAL: u16 = 1000;

/// Transport level event delivered to the [`FeedSupervisor`](crate::supervisor::FeedSupervisor).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum TransportEvent {
    /// Text frame payload.
    Message(String),
    /// Connection closed. `code` is `None` when no close frame was received (abnormal close).
    Closed { code: Option<u16>, reason: String },
    /// Error on an open connection.
    Error(String),
}

/// Bidirectional text frame transport to the upstream feed.
///
/// Implementations own ping/pong handling. [`Transport::next_event`] must be cancel safe, it
/// is polled inside `tokio::select!` alongside shutdown & cooldown timers.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, url: &Url) -> Result<(), TransportError>;

    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    async fn next_event(&mut self) -> TransportEvent;

    /// Initiate a clean close. Closing a disconnected transport is a no-op.
    async fn close(&mut self);
}
