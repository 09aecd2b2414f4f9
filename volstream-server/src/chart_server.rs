use crate::sink::{BroadcastChartSink, ChartMessage};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Welcome message sent to every client on connect, carrying the latest point per asset.
pub fn welcome_message(latest: &[ChartMessage]) -> serde_json::Value {
    serde_json::json!({
        "type": "welcome",
        "message": "Connected to volstream volatility feed",
        "timestamp": Utc::now(),
        "latest": latest,
    })
}

/// Bind the chart server and accept clients until the listener fails.
pub async fn start_chart_server(addr: SocketAddr, sink: BroadcastChartSink) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "chart server listening");
    serve(listener, sink).await
}

async fn serve(listener: TcpListener, sink: BroadcastChartSink) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!(%peer_addr, "new chart client connection");
        tokio::spawn(handle_client(stream, peer_addr, sink.clone()));
    }
}

/// Handle individual chart client connection
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, sink: BroadcastChartSink) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            error!(%peer_addr, %error, "chart client handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = sink.subscribe();

    let welcome = welcome_message(&sink.snapshot());
    if ws_sender
        .send(Message::text(welcome.to_string()))
        .await
        .is_err()
    {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let Ok(json) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if ws_sender.send(Message::text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Client fell behind, skip and keep it connected
                    warn!(%peer_addr, skipped, "chart client lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(%peer_addr, "chart broadcast channel closed");
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!(%peer_addr, text = %text.as_str(), "ignoring chart client message")
                }
                Err(error) => {
                    debug!(%peer_addr, %error, "chart client error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(%peer_addr, "chart client disconnected");
}
