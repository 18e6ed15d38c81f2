//! Peer connection management.
//!
//! The browser media runtime (RTCPeerConnection + getUserMedia) is an
//! injected capability: two traits covering the operations the engine
//! needs. The CLI harness and the tests substitute native fakes with the
//! same contract. `PeerManager` owns the single active connection per
//! session and sequences negotiation through the candidate buffer.

use thiserror::Error;
use tokio::sync::mpsc;

use super::bandwidth::{CaptureProfile, IceTransportPolicy, MediaPlan};
use super::ice::IceCandidateBuffer;

/// Media capture failures, classified for distinct user-facing messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("no capture device found")]
    DeviceNotFound,
    #[error("capture failed: {0}")]
    Other(String),
}

impl CaptureError {
    /// Actionable message for the person waiting on the call.
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::PermissionDenied => {
                "Camera/microphone access is blocked. Allow it in your browser \
                 settings and try again."
                    .to_string()
            }
            CaptureError::DeviceNotFound => {
                "No camera or microphone was found on this device.".to_string()
            }
            CaptureError::Other(_) => {
                "Your camera or microphone could not be started.".to_string()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no active peer connection")]
    NoConnection,
    #[error("description apply failed: {0}")]
    Sdp(String),
    #[error("candidate apply failed: {0}")]
    Candidate(String),
    #[error("{0}")]
    Other(String),
}

/// Peer connection lifecycle states, mirroring RTCPeerConnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Selected ICE candidate pair endpoint types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    Srflx,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Captured local media: always audio, video when the plan asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub audio: LocalTrack,
    pub video: Option<LocalTrack>,
}

impl LocalMedia {
    /// Does this capture satisfy the requested audio/video shape?
    pub fn satisfies(&self, wants_video: bool) -> bool {
        self.video.is_some() == wants_video
    }
}

/// One statistics sample from the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerStats {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub local_candidate: Option<CandidateKind>,
    pub remote_candidate: Option<CandidateKind>,
}

/// Asynchronous notifications from the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate to forward over signaling.
    LocalCandidate(String),
    ConnectionState(PeerConnState),
    RemoteTrack(TrackKind),
}

/// One peer connection, as the engine sees it.
#[allow(async_fn_in_trait)]
pub trait PeerConnection {
    async fn create_offer(&mut self) -> Result<String, PeerError>;
    async fn create_answer(&mut self) -> Result<String, PeerError>;
    async fn set_local_description(&mut self, sdp: &str) -> Result<(), PeerError>;
    async fn set_remote_description(&mut self, sdp: &str) -> Result<(), PeerError>;
    async fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), PeerError>;
    async fn add_track(&mut self, track: &LocalTrack) -> Result<(), PeerError>;
    /// Stop and remove every outgoing track.
    async fn remove_tracks(&mut self);
    async fn sample_stats(&mut self) -> Result<PeerStats, PeerError>;
    fn connection_state(&self) -> PeerConnState;
    /// Take the event stream; yields once, on the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;
    fn close(&mut self);
}

/// Factory + capture side of the injected runtime.
#[allow(async_fn_in_trait)]
pub trait MediaRuntime {
    type Conn: PeerConnection;
    async fn new_connection(&self, policy: IceTransportPolicy) -> Result<Self::Conn, PeerError>;
    async fn capture(&self, video: Option<&CaptureProfile>) -> Result<LocalMedia, CaptureError>;
}

/// Owns the single active peer connection for a session.
pub struct PeerManager<R: MediaRuntime> {
    runtime: R,
    conn: Option<R::Conn>,
    local: Option<LocalMedia>,
    buffer: IceCandidateBuffer,
    remote_description_set: bool,
}

impl<R: MediaRuntime> PeerManager<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            conn: None,
            local: None,
            buffer: IceCandidateBuffer::new(),
            remote_description_set: false,
        }
    }

    pub fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connection_state(&self) -> Option<PeerConnState> {
        self.conn.as_ref().map(|c| c.connection_state())
    }

    /// Return the active connection, creating it lazily with the given ICE
    /// transport policy.
    pub async fn ensure(&mut self, policy: IceTransportPolicy) -> Result<(), PeerError> {
        if self.conn.is_none() {
            tracing::debug!("Creating peer connection (ice policy {:?})", policy);
            self.conn = Some(self.runtime.new_connection(policy).await?);
            self.remote_description_set = false;
        }
        Ok(())
    }

    /// Take the event stream of the current connection (once per
    /// connection).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.conn.as_mut().and_then(|c| c.take_events())
    }

    /// Capture local media per the plan and add the tracks to the
    /// connection. Idempotent with respect to the requested shape: a
    /// capture that already satisfies it is reused; otherwise the existing
    /// tracks are stopped and a fresh capture replaces them.
    pub async fn attach_local_media(
        &mut self,
        plan: &MediaPlan,
    ) -> Result<LocalMedia, CaptureError> {
        if let Some(ref local) = self.local {
            if local.satisfies(plan.wants_video()) {
                tracing::debug!("Reusing local media (video={})", plan.wants_video());
                return Ok(local.clone());
            }
            if let Some(conn) = self.conn.as_mut() {
                conn.remove_tracks().await;
            }
            self.local = None;
        }

        let media = self.runtime.capture(plan.video.as_ref()).await?;

        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.add_track(&media.audio).await {
                tracing::warn!("Failed to add audio track: {}", e);
            }
            if let Some(ref video) = media.video {
                if let Err(e) = conn.add_track(video).await {
                    tracing::warn!("Failed to add video track: {}", e);
                }
            }
        }

        self.local = Some(media.clone());
        Ok(media)
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local.as_ref()
    }

    /// Create an offer and set it as the local description before it is
    /// handed out for sending.
    pub async fn create_offer(&mut self) -> Result<String, PeerError> {
        let conn = self.conn.as_mut().ok_or(PeerError::NoConnection)?;
        let sdp = conn.create_offer().await?;
        conn.set_local_description(&sdp).await?;
        Ok(sdp)
    }

    /// Apply a remote offer, drain buffered candidates, and produce the
    /// local answer (set as local description before returning).
    pub async fn answer_remote_offer(&mut self, remote_sdp: &str) -> Result<String, PeerError> {
        self.apply_remote_description(remote_sdp).await?;
        let conn = self.conn.as_mut().ok_or(PeerError::NoConnection)?;
        let sdp = conn.create_answer().await?;
        conn.set_local_description(&sdp).await?;
        Ok(sdp)
    }

    /// Apply a remote answer and drain buffered candidates.
    pub async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        self.apply_remote_description(sdp).await
    }

    async fn apply_remote_description(&mut self, sdp: &str) -> Result<(), PeerError> {
        let conn = self.conn.as_mut().ok_or(PeerError::NoConnection)?;
        conn.set_remote_description(sdp).await?;
        self.remote_description_set = true;

        // Drain exactly once, in arrival order. A malformed or stale
        // candidate must not abort the rest.
        let queued = self.buffer.drain();
        if !queued.is_empty() {
            tracing::debug!("Draining {} buffered ICE candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = conn.add_remote_candidate(&candidate).await {
                tracing::debug!("Ignoring failed buffered candidate: {}", e);
            }
        }
        Ok(())
    }

    /// Apply a remote candidate now if the remote description allows it,
    /// otherwise hold it for the drain.
    pub async fn enqueue_or_apply_candidate(&mut self, candidate: String) {
        if self.remote_description_set {
            if let Some(conn) = self.conn.as_mut() {
                if let Err(e) = conn.add_remote_candidate(&candidate).await {
                    tracing::debug!("Ignoring failed candidate: {}", e);
                }
                return;
            }
        }
        self.buffer.push(candidate);
    }

    pub async fn sample_stats(&mut self) -> Result<PeerStats, PeerError> {
        let conn = self.conn.as_mut().ok_or(PeerError::NoConnection)?;
        conn.sample_stats().await
    }

    /// Unconditional release: stop outgoing tracks, close the connection,
    /// discard buffered candidates. Safe to call in any state.
    pub async fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.remove_tracks().await;
            conn.close();
        }
        self.local = None;
        self.buffer.clear();
        self.remote_description_set = false;
    }
}
