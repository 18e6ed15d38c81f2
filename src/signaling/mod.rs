//! Signaling channel client.
//!
//! One `SignalClient` owns the WebSocket for a session and keeps it alive
//! across transient failures with bounded, capped-backoff reconnection.
//! Transport state changes are surfaced as events alongside decoded
//! signaling frames; consumers treat them as network-quality signals, never
//! as call termination.

pub mod event;
pub mod pool;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;

use event::SignalEvent;
use socket::SignalSocket;

/// Reconnect backoff starts here and doubles per attempt.
const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);

/// Backoff ceiling.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Consecutive failed reconnect attempts before the transport gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 8;

/// WebSocket keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Transport-level state of the signaling connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Reconnect budget exhausted; the client will not try again.
    Failed,
}

/// Everything a signaling consumer can observe on the channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Transport(TransportStatus),
    Signal(SignalEvent),
}

/// Live signaling connection for one session.
///
/// Cheap to share (`Arc`); all consumers subscribe to the same broadcast
/// stream. Only the pool closes it — see [`pool::SignalingPool`].
pub struct SignalClient {
    session_id: String,
    display_name: String,
    out_tx: mpsc::UnboundedSender<SignalEvent>,
    events_tx: broadcast::Sender<ChannelEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalClient {
    /// Establish the first connection, join the session room, and spawn the
    /// read/write/reconnect loop.
    pub async fn connect(
        base_url: &str,
        session_id: &str,
        display_name: &str,
    ) -> Result<Arc<Self>> {
        let socket = SignalSocket::connect(base_url, session_id).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = Arc::new(Self {
            session_id: session_id.to_string(),
            display_name: display_name.to_string(),
            out_tx,
            events_tx: events_tx.clone(),
            shutdown_tx,
        });

        tokio::spawn(run_loop(
            base_url.to_string(),
            client.session_id.clone(),
            client.display_name.clone(),
            socket,
            out_rx,
            events_tx,
            shutdown_rx,
        ));

        Ok(client)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Subscribe to transport and signaling events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Queue an event for sending. Events queued while the transport is
    /// reconnecting are flushed once it comes back.
    pub fn send(&self, event: SignalEvent) {
        if self.out_tx.send(event).is_err() {
            tracing::warn!(
                "Signaling send after transport shut down (session {})",
                self.session_id
            );
        }
    }

    /// Tear the connection down. Idempotent; only the pool calls this.
    pub(crate) fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Read/write loop with reconnection.
///
/// Backoff doubles from 1s to a 30s cap and resets after any successful
/// connect; after `MAX_RECONNECT_ATTEMPTS` consecutive failures the loop
/// emits `Failed` and exits.
async fn run_loop(
    base_url: String,
    session_id: String,
    display_name: String,
    mut socket: SignalSocket,
    mut out_rx: mpsc::UnboundedReceiver<SignalEvent>,
    events_tx: broadcast::Sender<ChannelEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_BACKOFF_START;
    let mut failed_attempts = 0u32;

    loop {
        // Announce the room join before anything else on a fresh socket.
        let join = SignalEvent::Join {
            session_id: session_id.clone(),
            display_name: display_name.clone(),
        };
        if let Err(e) = socket.send_event(&join).await {
            tracing::warn!("Session join send failed: {:#}", e);
        }
        let _ = events_tx.send(ChannelEvent::Transport(TransportStatus::Connected));

        let mut ping = time::interval(PING_INTERVAL);
        ping.tick().await; // skip the immediate first tick

        let disconnect_error = loop {
            tokio::select! {
                frame = socket.recv_event() => {
                    match frame {
                        Ok(Some(event)) => {
                            failed_attempts = 0;
                            backoff = RECONNECT_BACKOFF_START;
                            let _ = events_tx.send(ChannelEvent::Signal(event));
                        }
                        Ok(None) => break anyhow::anyhow!("closed by server"),
                        Err(e) => break e,
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(event) => {
                            if let Err(e) = socket.send_event(&event).await {
                                break e;
                            }
                        }
                        None => {
                            // All senders dropped; nothing left to do.
                            return;
                        }
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = socket.send_ping().await {
                        break e;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("Signaling client shut down (session {})", session_id);
                        return;
                    }
                }
            }
        };

        tracing::warn!(
            "Signaling transport lost (session {}): {:#}",
            session_id,
            disconnect_error
        );
        let _ = events_tx.send(ChannelEvent::Transport(TransportStatus::Disconnected));

        // Reconnect with capped backoff, bounded attempts.
        socket = loop {
            failed_attempts += 1;
            if failed_attempts > MAX_RECONNECT_ATTEMPTS {
                tracing::error!(
                    "Signaling reconnect budget exhausted (session {})",
                    session_id
                );
                let _ = events_tx.send(ChannelEvent::Transport(TransportStatus::Failed));
                return;
            }
            let _ = events_tx.send(ChannelEvent::Transport(TransportStatus::Reconnecting {
                attempt: failed_attempts,
            }));

            tokio::select! {
                _ = time::sleep(backoff) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);

            match SignalSocket::connect(&base_url, &session_id).await {
                Ok(s) => break s,
                Err(e) => {
                    tracing::warn!(
                        "Signaling reconnect attempt {} failed: {:#}",
                        failed_attempts,
                        e
                    );
                }
            }
        };
    }
}
