use super::{
    Transport, TransportEvent,
    timeout::{DEFAULT_READ_TIMEOUT, TimeoutStream},
};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, protocol::frame::coding::CloseCode},
};
use tracing::{debug, info};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    sink: SplitSink<WsStream, Message>,
    stream: TimeoutStream<SplitStream<WsStream>>,
}

/// WebSocket [`Transport`] with an idle read timeout.
pub struct WebSocketTransport {
    read_timeout: Duration,
    connection: Option<Connection>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("read_timeout", &self.read_timeout)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT)
    }
}

impl WebSocketTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, url: &Url) -> Result<(), TransportError> {
        self.connection = None;

        let (websocket, response) =
            connect_async(url.as_str())
                .await
                .map_err(|error| TransportError::Connect {
                    url: url.to_string(),
                    reason: error.to_string(),
                })?;
        info!(%url, status = %response.status(), "feed connected");

        let (sink, stream) = websocket.split();
        self.connection = Some(Connection {
            sink,
            stream: TimeoutStream::new(stream, self.read_timeout),
        });
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(TransportError::NotConnected)?;

        connection
            .sink
            .send(Message::text(text))
            .await
            .map_err(|error| TransportError::Send(error.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(connection) = self.connection.as_mut() else {
            return TransportEvent::Closed {
                code: None,
                reason: TransportError::NotConnected.to_string(),
            };
        };

        loop {
            match connection.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(text.as_str().to_owned());
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return TransportEvent::Message(text),
                    Err(error) => debug!(%error, "skipping non utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let event = match frame {
                        Some(frame) => TransportEvent::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.as_str().to_owned(),
                        },
                        None => TransportEvent::Closed {
                            code: Some(u16::from(CloseCode::Status)),
                            reason: String::new(),
                        },
                    };
                    self.connection = None;
                    return event;
                }
                // Pong replies are queued by tungstenite while reading
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(error)) => {
                    self.connection = None;
                    return TransportEvent::Error(error.to_string());
                }
                None => {
                    let reason = if connection.stream.timed_out() {
                        "read timeout"
                    } else {
                        "stream ended without close frame"
                    };
                    self.connection = None;
                    return TransportEvent::Closed {
                        code: None,
                        reason: reason.to_string(),
                    };
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(error) = connection.sink.close().await {
                debug!(%error, "error closing feed connection");
            }
        }
    }
}
