//! Signaling WebSocket connection and frame handling.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::event::SignalEvent;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct SignalSocket {
    stream: WsStream,
}

impl SignalSocket {
    /// Connect to the signaling endpoint for a session.
    ///
    /// The session id rides in the URL path; no auth handshake happens on
    /// the socket itself.
    pub async fn connect(base_url: &str, session_id: &str) -> Result<Self> {
        let ws_url = format!("{}/sessions/{}", base_url.trim_end_matches('/'), session_id);
        let ws_url = ws_url
            .replace("https://", "wss://")
            .replace("http://", "ws://");

        tracing::info!("Connecting signaling socket to {}", ws_url);

        let (stream, response) = connect_async(&ws_url)
            .await
            .context("Signaling WebSocket connection failed")?;

        tracing::info!("Signaling socket connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Send one signaling event as a text frame.
    pub async fn send_event(&mut self, event: &SignalEvent) -> Result<()> {
        let text = serde_json::to_string(event).context("Failed to encode signaling event")?;
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send signaling frame")
    }

    /// Send a WebSocket ping frame (keepalive).
    pub async fn send_ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .context("Failed to send ping")
    }

    /// Receive the next signaling event, replying to pings and skipping
    /// frames that do not decode. Returns `None` on a clean close.
    pub async fn recv_event(&mut self) -> Result<Option<SignalEvent>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match serde_json::from_str::<SignalEvent>(&text) {
                        Ok(event) => return Ok(Some(event)),
                        Err(e) => {
                            // Unknown event names are tolerated: the server may
                            // add events this client does not consume.
                            tracing::debug!("Undecodable signaling frame ({}): {}", e, text);
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("Signaling socket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("Signaling socket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}
