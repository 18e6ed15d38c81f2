//! Loopback media runtime for the signaling test harness.
//!
//! Implements the injected peer/capture contract without any browser or
//! media stack: SDP blobs are fabricated, candidates are emitted for the
//! configured transport policy, and the connection reports `connected` as
//! soon as both descriptions are in place. `gatecall call` runs against
//! this runtime to exercise the full engine end to end.

use tokio::sync::mpsc;
use uuid::Uuid;

use super::bandwidth::{CaptureProfile, IceTransportPolicy};
use super::peer::{
    CandidateKind, CaptureError, LocalMedia, LocalTrack, MediaRuntime, PeerConnState,
    PeerConnection, PeerError, PeerEvent, PeerStats, TrackKind,
};

pub struct LoopbackRuntime;

impl MediaRuntime for LoopbackRuntime {
    type Conn = LoopbackConnection;

    async fn new_connection(
        &self,
        policy: IceTransportPolicy,
    ) -> Result<LoopbackConnection, PeerError> {
        Ok(LoopbackConnection::new(policy))
    }

    async fn capture(&self, video: Option<&CaptureProfile>) -> Result<LocalMedia, CaptureError> {
        Ok(LocalMedia {
            audio: LocalTrack {
                id: format!("audio-{}", Uuid::new_v4()),
                kind: TrackKind::Audio,
            },
            video: video.map(|profile| {
                tracing::debug!(
                    "Loopback video capture at {}x{}@{}",
                    profile.width.ideal,
                    profile.height.ideal,
                    profile.frame_rate.ideal
                );
                LocalTrack {
                    id: format!("video-{}", Uuid::new_v4()),
                    kind: TrackKind::Video,
                }
            }),
        })
    }
}

pub struct LoopbackConnection {
    policy: IceTransportPolicy,
    state: PeerConnState,
    local_description: Option<String>,
    remote_description: Option<String>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl LoopbackConnection {
    fn new(policy: IceTransportPolicy) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            policy,
            state: PeerConnState::New,
            local_description: None,
            remote_description: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    fn fabricate_sdp(kind: &str) -> String {
        let mut ufrag = Uuid::new_v4().simple().to_string();
        ufrag.truncate(8);
        let pwd = Uuid::new_v4().simple().to_string();
        format!(
            "v=0\r\n\
             o=- {} 0 IN IP4 127.0.0.1\r\n\
             s=gatecall-{}\r\n\
             t=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
             a=ice-ufrag:{}\r\n\
             a=ice-pwd:{}\r\n\
             a=mid:0\r\n",
            Uuid::new_v4().simple(),
            kind,
            ufrag,
            pwd
        )
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn selected_candidate(&self) -> CandidateKind {
        match self.policy {
            IceTransportPolicy::All => CandidateKind::Host,
            IceTransportPolicy::Relay => CandidateKind::Relay,
        }
    }

    /// Loopback negotiation completes once both descriptions are set.
    fn maybe_connect(&mut self) {
        if self.local_description.is_some()
            && self.remote_description.is_some()
            && self.state == PeerConnState::New
        {
            self.state = PeerConnState::Connecting;
            self.emit(PeerEvent::ConnectionState(PeerConnState::Connecting));
            self.state = PeerConnState::Connected;
            self.emit(PeerEvent::ConnectionState(PeerConnState::Connected));
            self.emit(PeerEvent::RemoteTrack(TrackKind::Audio));
        }
    }
}

impl PeerConnection for LoopbackConnection {
    async fn create_offer(&mut self) -> Result<String, PeerError> {
        Ok(Self::fabricate_sdp("offer"))
    }

    async fn create_answer(&mut self) -> Result<String, PeerError> {
        if self.remote_description.is_none() {
            return Err(PeerError::Sdp("answer before remote offer".into()));
        }
        Ok(Self::fabricate_sdp("answer"))
    }

    async fn set_local_description(&mut self, sdp: &str) -> Result<(), PeerError> {
        self.local_description = Some(sdp.to_string());
        let kind = match self.selected_candidate() {
            CandidateKind::Relay => "relay",
            _ => "host",
        };
        self.emit(PeerEvent::LocalCandidate(format!(
            "candidate:1 1 UDP 2130706431 127.0.0.1 9 typ {}",
            kind
        )));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&mut self, sdp: &str) -> Result<(), PeerError> {
        if !sdp.starts_with("v=0") {
            return Err(PeerError::Sdp("not an SDP blob".into()));
        }
        self.remote_description = Some(sdp.to_string());
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), PeerError> {
        if !candidate.starts_with("candidate:") {
            return Err(PeerError::Candidate(candidate.to_string()));
        }
        Ok(())
    }

    async fn add_track(&mut self, _track: &LocalTrack) -> Result<(), PeerError> {
        Ok(())
    }

    async fn remove_tracks(&mut self) {}

    async fn sample_stats(&mut self) -> Result<PeerStats, PeerError> {
        if self.state != PeerConnState::Connected {
            return Err(PeerError::NoConnection);
        }
        Ok(PeerStats {
            rtt_ms: 42.0,
            jitter_ms: 3.5,
            packet_loss_pct: 0.0,
            local_candidate: Some(self.selected_candidate()),
            remote_candidate: Some(self.selected_candidate()),
        })
    }

    fn connection_state(&self) -> PeerConnState {
        self.state
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.take()
    }

    fn close(&mut self) {
        self.state = PeerConnState::Closed;
    }
}
