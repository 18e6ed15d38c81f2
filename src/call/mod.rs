//! Call/session coordination engine.
//!
//! One `SessionDriver` runs per open session view: an actor-style event
//! loop over UI intents, signaling events, peer-connection events, and its
//! own timers. Between awaits, state transitions are atomic for the
//! session; every timer is owned by the loop and checked against the call
//! state at fire time, so nothing fires into an ended call.

pub mod access;
pub mod bandwidth;
pub mod harness;
pub mod ice;
pub mod peer;
pub mod quality;
pub mod recovery;
pub mod retry;
pub mod state;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;

use crate::alerts::{Alert, AlertSink};
use crate::chat::{ChatMessage, MessageChannel};
use crate::signaling::event::{ControlAction, SenderRole, SignalEvent};
use crate::signaling::{ChannelEvent, TransportStatus};

use access::AccessGrants;
use bandwidth::BandwidthAdaptationPolicy;
use peer::{MediaRuntime, PeerConnState, PeerEvent, PeerManager};
use quality::{Diagnostics, NetworkQualityMonitor, QualityTier, STATS_POLL_INTERVAL};
use recovery::{ConnectionRecoveryPolicy, RecoveryDecision};
use retry::{OfferRetryScheduler, RetryDecision, OFFER_RETRY_INTERVAL};
use state::{CallSession, CallState, EndReason, LaunchStage, OfferDisposition, StartOutcome};

/// Local user intents fed to the driver by the UI.
#[derive(Debug, Clone)]
pub enum SessionIntent {
    StartCall { wants_video: bool },
    AcceptCall,
    RejectCall,
    HangUp,
    SetMuted(bool),
    SetCamera(bool),
    SendMessage { text: String },
    RetryMessage { client_id: String },
    /// View unmount: end any call and stop the driver.
    Shutdown,
}

/// What the UI renders: call state, media flags, quality, chat.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: String,
    pub launch_stage: LaunchStage,
    pub quality: QualityTier,
    pub diagnostics: Diagnostics,
    pub muted: bool,
    pub camera_on: bool,
    pub remote_muted: bool,
    /// "audio" or "video" once a call mode is settled, empty before.
    pub accepted_mode: String,
    pub started_at: Option<DateTime<Utc>>,
    pub status_message: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: "idle".to_string(),
            launch_stage: LaunchStage::Idle,
            quality: QualityTier::Good,
            diagnostics: Diagnostics::default(),
            muted: false,
            camera_on: false,
            remote_muted: false,
            accepted_mode: String::new(),
            started_at: None,
            status_message: None,
            messages: Vec::new(),
        }
    }
}

enum Wake {
    Intent(Option<SessionIntent>),
    Signal(ChannelEvent),
    SignalsClosed,
    Peer(Option<PeerEvent>),
    RetryTick,
    StatsTick,
}

pub struct SessionDriver<R: MediaRuntime> {
    session_id: String,
    session: CallSession,
    peer: PeerManager<R>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    retry: OfferRetryScheduler,
    recovery: ConnectionRecoveryPolicy,
    monitor: NetworkQualityMonitor,
    adaptation: BandwidthAdaptationPolicy,
    chat: MessageChannel,
    grants: Arc<AccessGrants>,
    alerts: Arc<dyn AlertSink>,
    signal_tx: mpsc::UnboundedSender<SignalEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    room_joined: bool,
    remote_display_name: Option<String>,
    status_message: Option<String>,
}

impl<R: MediaRuntime> SessionDriver<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: &str,
        display_name: &str,
        role: SenderRole,
        runtime: R,
        adaptation: BandwidthAdaptationPolicy,
        signal_tx: mpsc::UnboundedSender<SignalEvent>,
        alerts: Arc<dyn AlertSink>,
        grants: Arc<AccessGrants>,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let driver = Self {
            session_id: session_id.to_string(),
            session: CallSession::new(adaptation.low_bandwidth),
            peer: PeerManager::new(runtime),
            peer_events: None,
            retry: OfferRetryScheduler::default(),
            recovery: ConnectionRecoveryPolicy::default(),
            monitor: NetworkQualityMonitor::new(),
            adaptation,
            chat: MessageChannel::new(session_id, display_name, role),
            grants,
            alerts,
            signal_tx,
            snapshot_tx,
            room_joined: false,
            remote_display_name: None,
            status_message: None,
        };
        (driver, snapshot_rx)
    }

    /// Seed the chat with history fetched on mount.
    pub fn merge_history(&mut self, history: Vec<crate::api::HistoryMessage>) {
        self.chat.merge_history(history);
        self.publish();
    }

    /// Run the session actor until the view shuts it down.
    pub async fn run(
        mut self,
        mut intents: mpsc::Receiver<SessionIntent>,
        mut signals: broadcast::Receiver<ChannelEvent>,
    ) {
        let mut retry_tick = time::interval(OFFER_RETRY_INTERVAL);
        let mut stats_tick = time::interval(STATS_POLL_INTERVAL);
        retry_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        stats_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut signals_closed = false;

        self.publish();

        loop {
            let wake = tokio::select! {
                intent = intents.recv() => Wake::Intent(intent),
                signal = signals.recv(), if !signals_closed => match signal {
                    Ok(ev) => Wake::Signal(ev),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signaling consumer lagged, skipped {}", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => Wake::SignalsClosed,
                },
                event = recv_peer_event(&mut self.peer_events) => Wake::Peer(event),
                _ = retry_tick.tick() => Wake::RetryTick,
                _ = stats_tick.tick() => Wake::StatsTick,
            };

            match wake {
                Wake::Intent(Some(intent)) => {
                    if !self.handle_intent(intent).await {
                        break;
                    }
                }
                Wake::Intent(None) => {
                    // UI went away without an explicit shutdown.
                    self.end_call(EndReason::LocalHangup, true).await;
                    break;
                }
                Wake::Signal(ChannelEvent::Transport(status)) => {
                    self.monitor.on_transport(&status);
                    self.publish();
                }
                Wake::Signal(ChannelEvent::Signal(event)) => {
                    self.handle_signal(event).await;
                }
                Wake::SignalsClosed => {
                    signals_closed = true;
                    self.monitor.on_transport(&TransportStatus::Failed);
                    self.publish();
                }
                Wake::Peer(Some(event)) => {
                    self.handle_peer_event(event).await;
                }
                Wake::Peer(None) => {
                    // Connection dropped its sender; release() follows soon.
                    self.peer_events = None;
                }
                Wake::RetryTick => {
                    self.handle_retry_tick().await;
                }
                Wake::StatsTick => {
                    self.handle_stats_tick().await;
                }
            }
        }
    }

    async fn handle_intent(&mut self, intent: SessionIntent) -> bool {
        match intent {
            SessionIntent::StartCall { wants_video } => {
                self.session.reset_to_idle();
                self.status_message = None;
                match self.session.start_call(wants_video, self.room_joined) {
                    StartOutcome::Proceed { wants_video } => {
                        self.negotiate(wants_video).await;
                    }
                    StartOutcome::Queued => {
                        tracing::info!(
                            "Call queued until signaling room is joined (session {})",
                            self.session_id
                        );
                    }
                    StartOutcome::Rejected => {
                        tracing::debug!("Start-call intent ignored, call already in progress");
                    }
                }
            }
            SessionIntent::AcceptCall => {
                self.accept_incoming().await;
            }
            SessionIntent::RejectCall => {
                self.send_signal(SignalEvent::Control {
                    session_id: self.session_id.clone(),
                    action: ControlAction::CallRejected,
                });
                self.end_call(EndReason::Rejected, false).await;
            }
            SessionIntent::HangUp => {
                self.end_call(EndReason::LocalHangup, true).await;
            }
            SessionIntent::SetMuted(muted) => {
                self.session.muted = muted;
                self.send_signal(SignalEvent::Control {
                    session_id: self.session_id.clone(),
                    action: if muted {
                        ControlAction::Mute
                    } else {
                        ControlAction::Unmute
                    },
                });
            }
            SessionIntent::SetCamera(on) => {
                if on && self.peer.local_media().map(|m| m.video.is_none()).unwrap_or(true) {
                    // No video track attached (demoted or audio call).
                    self.session.pending_video_upgrade = true;
                } else {
                    self.session.camera_on = on;
                }
            }
            SessionIntent::SendMessage { text } => {
                let event = self.chat.send(&text);
                self.send_signal(event);
            }
            SessionIntent::RetryMessage { client_id } => {
                if let Some(event) = self.chat.resubmit(&client_id) {
                    self.send_signal(event);
                }
            }
            SessionIntent::Shutdown => {
                self.end_call(EndReason::LocalHangup, true).await;
                return false;
            }
        }
        self.publish();
        true
    }

    async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Joined { .. } => {
                self.room_joined = true;
                if let Some(wants_video) = self.session.room_joined() {
                    tracing::info!("Room joined, resuming queued call (session {})", self.session_id);
                    self.negotiate(wants_video).await;
                }
            }
            SignalEvent::ParticipantJoined { display_name, .. } => {
                self.remote_display_name = Some(display_name);
            }
            SignalEvent::ParticipantLeft { display_name, .. } => {
                tracing::info!("Participant left: {}", display_name);
            }
            SignalEvent::Offer { sdp, .. } => {
                let wants_video = sdp.contains("m=video");
                match self.session.remote_offer_received(sdp.clone(), wants_video) {
                    OfferDisposition::Ring => {
                        self.status_message = None;
                        self.grants.grant(&self.session_id);
                        self.alerts.notify(Alert::IncomingCall {
                            session_id: self.session_id.clone(),
                            display_name: self
                                .remote_display_name
                                .clone()
                                .unwrap_or_default(),
                            wants_video,
                        });
                    }
                    OfferDisposition::Renegotiate => {
                        self.answer_renegotiation(&sdp).await;
                    }
                    OfferDisposition::Ignored => {
                        tracing::debug!("Remote offer ignored (negotiation outstanding)");
                    }
                }
            }
            SignalEvent::Answer { sdp, .. } => {
                self.apply_answer(&sdp).await;
            }
            SignalEvent::Ice { candidate, .. } => {
                if self.session.is_active() {
                    self.peer.enqueue_or_apply_candidate(candidate).await;
                } else {
                    tracing::debug!("Candidate outside any call dropped");
                }
            }
            SignalEvent::ChatMessage {
                text,
                display_name,
                sender_type,
                client_id,
                ..
            } => {
                let cid = if client_id.is_empty() {
                    None
                } else {
                    Some(client_id.as_str())
                };
                self.chat.on_echo(&text, &display_name, sender_type, cid);
            }
            SignalEvent::ChatPersisted { id, client_id, .. } => {
                self.chat.on_persisted(&id, &client_id);
            }
            SignalEvent::ChatPersistFailed {
                id,
                client_id,
                error,
                ..
            } => {
                self.chat
                    .on_persist_failed(id.as_deref(), &client_id, &error);
                self.alerts.notify(Alert::MessageNotSaved {
                    session_id: self.session_id.clone(),
                    error,
                });
            }
            SignalEvent::Control { action, .. } => match action {
                ControlAction::Mute => self.session.remote_muted = true,
                ControlAction::Unmute => self.session.remote_muted = false,
                ControlAction::End => self.end_call(EndReason::RemoteHangup, false).await,
                ControlAction::CallRejected => self.end_call(EndReason::Rejected, false).await,
            },
            SignalEvent::Join { .. } => {}
        }
        self.publish();
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalEvent::Ice {
                    session_id: self.session_id.clone(),
                    candidate,
                });
            }
            PeerEvent::ConnectionState(state) => {
                self.handle_peer_state(state).await;
            }
            PeerEvent::RemoteTrack(kind) => {
                tracing::debug!("Remote track added: {:?}", kind);
            }
        }
        self.publish();
    }

    async fn handle_peer_state(&mut self, state: PeerConnState) {
        if !self.session.is_active() {
            return;
        }

        if state == PeerConnState::Connected {
            if self.session.peer_connected() {
                self.grants.grant(&self.session_id);
            }
            return;
        }

        if !matches!(
            state,
            PeerConnState::Failed | PeerConnState::Disconnected | PeerConnState::Closed
        ) {
            return;
        }

        // Recovery applies to the established call only.
        if !matches!(
            self.session.state(),
            CallState::Connected { .. } | CallState::Reconnecting { .. }
        ) {
            return;
        }

        match self.recovery.on_peer_state(state, self.session.role()) {
            RecoveryDecision::Recover { attempt } => {
                tracing::info!(
                    "Peer connection {:?}; recovery attempt {} with relay + audio-only",
                    state,
                    attempt
                );
                self.session.enter_reconnecting(attempt);
                self.peer.release().await;
                self.peer_events = None;
                self.negotiate(false).await;
            }
            RecoveryDecision::EndCall => {
                self.end_call(EndReason::RecoveryExhausted, true).await;
            }
            RecoveryDecision::Ignore => {}
        }
    }

    async fn handle_retry_tick(&mut self) {
        let still_ringing = matches!(self.session.state(), CallState::Ringing { .. });
        match self.retry.on_tick(still_ringing) {
            RetryDecision::Resend { .. } => {
                if let Some(pending) = self.session.record_offer_retry() {
                    tracing::info!(
                        "Resending offer (attempt {}, session {})",
                        pending.retry_attempt,
                        self.session_id
                    );
                    self.send_signal(SignalEvent::Offer {
                        session_id: self.session_id.clone(),
                        sdp: pending.sdp,
                        retry_attempt: Some(pending.retry_attempt),
                    });
                }
            }
            RetryDecision::GiveUp => {
                tracing::warn!("Offer retries exhausted, marking network degraded");
                self.monitor.mark_degraded();
                self.status_message =
                    Some("Still ringing — the network looks slow.".to_string());
                self.alerts.notify(Alert::NetworkDegraded {
                    session_id: self.session_id.clone(),
                });
                self.publish();
            }
            RetryDecision::Idle => {}
        }
    }

    async fn handle_stats_tick(&mut self) {
        if !self.peer.has_connection() || !self.session.is_active() {
            return;
        }
        let conn_state = self
            .peer
            .connection_state()
            .unwrap_or(PeerConnState::New);
        match self.peer.sample_stats().await {
            Ok(stats) => {
                self.monitor.on_stats(&stats, conn_state);
                self.publish();
            }
            Err(e) => {
                tracing::debug!("Stats sample unavailable: {}", e);
            }
        }
    }

    /// Attach media per the adaptation plan and send an offer. Runs for the
    /// initial call and for recovery re-offers; the state machine guard
    /// makes a second concurrent attempt a no-op.
    async fn negotiate(&mut self, wants_video: bool) {
        let plan = self
            .adaptation
            .plan(wants_video, self.monitor.tier(), self.session.force_relay);

        if !self.session.begin_negotiation(plan.wants_video()) {
            tracing::debug!("Negotiation already outstanding, offer attempt dropped");
            return;
        }
        if plan.demoted {
            tracing::info!("Video demoted to audio-only before capture");
            self.session.pending_video_upgrade = wants_video;
        }

        if let Err(e) = self.peer.ensure(plan.ice_policy).await {
            self.status_message = Some(format!("Could not set up the call: {}", e));
            self.publish();
            return;
        }
        if self.peer_events.is_none() {
            self.peer_events = self.peer.take_events();
        }

        match self.peer.attach_local_media(&plan).await {
            Ok(media) => {
                self.session.camera_on = media.video.is_some();
            }
            Err(e) => {
                // Proceed receive-only; the caller hears the other side.
                tracing::warn!("Capture failed ({}), continuing receive-only", e);
                self.status_message = Some(e.user_message());
                self.alerts.notify(Alert::CaptureFailed {
                    session_id: self.session_id.clone(),
                    message: e.user_message(),
                });
            }
        }

        match self.peer.create_offer().await {
            Ok(sdp) => {
                self.send_signal(SignalEvent::Offer {
                    session_id: self.session_id.clone(),
                    sdp: sdp.clone(),
                    retry_attempt: None,
                });
                self.session.offer_sent(sdp);
                if matches!(self.session.state(), CallState::Ringing { .. }) {
                    self.retry.arm();
                }
            }
            Err(e) => {
                self.status_message = Some(format!("Could not start the call: {}", e));
            }
        }
        self.publish();
    }

    async fn accept_incoming(&mut self) {
        let Some((remote_sdp, wants_video)) = self.session.accept_incoming() else {
            tracing::debug!("Accept intent with no incoming call");
            return;
        };

        let plan = self
            .adaptation
            .plan(wants_video, self.monitor.tier(), self.session.force_relay);
        if plan.demoted {
            self.session.pending_video_upgrade = wants_video;
        }

        if let Err(e) = self.peer.ensure(plan.ice_policy).await {
            self.status_message = Some(format!("Could not set up the call: {}", e));
            self.publish();
            return;
        }
        if self.peer_events.is_none() {
            self.peer_events = self.peer.take_events();
        }

        match self.peer.attach_local_media(&plan).await {
            Ok(media) => {
                self.session.camera_on = media.video.is_some();
            }
            Err(e) => {
                tracing::warn!("Capture failed ({}), answering receive-only", e);
                self.status_message = Some(e.user_message());
                self.alerts.notify(Alert::CaptureFailed {
                    session_id: self.session_id.clone(),
                    message: e.user_message(),
                });
            }
        }

        match self.peer.answer_remote_offer(&remote_sdp).await {
            Ok(sdp) => {
                self.send_signal(SignalEvent::Answer {
                    session_id: self.session_id.clone(),
                    sdp,
                });
            }
            Err(e) => {
                self.status_message = Some(format!("Could not answer the call: {}", e));
            }
        }
        self.publish();
    }

    /// Callee side of a recovery re-offer: answer without ringing, on a
    /// fresh relay-routed connection, audio-only.
    async fn answer_renegotiation(&mut self, remote_sdp: &str) {
        self.peer.release().await;
        self.peer_events = None;

        let plan = self
            .adaptation
            .plan(false, self.monitor.tier(), self.session.force_relay);
        if let Err(e) = self.peer.ensure(plan.ice_policy).await {
            self.status_message = Some(format!("Could not set up the call: {}", e));
            return;
        }
        self.peer_events = self.peer.take_events();

        if let Err(e) = self.peer.attach_local_media(&plan).await {
            tracing::warn!("Capture failed during renegotiation ({}), receive-only", e);
        } else {
            self.session.camera_on = false;
        }

        match self.peer.answer_remote_offer(remote_sdp).await {
            Ok(sdp) => {
                self.send_signal(SignalEvent::Answer {
                    session_id: self.session_id.clone(),
                    sdp,
                });
            }
            Err(e) => {
                self.status_message = Some(format!("Could not answer the call: {}", e));
            }
        }
    }

    async fn apply_answer(&mut self, sdp: &str) {
        if !matches!(
            self.session.state(),
            CallState::Ringing { .. } | CallState::Reconnecting { .. }
        ) {
            tracing::debug!("Stale answer ignored");
            return;
        }
        match self.peer.apply_remote_answer(sdp).await {
            Ok(()) => {
                self.retry.cancel();
                if self.session.answer_received() {
                    self.grants.grant(&self.session_id);
                    self.status_message = None;
                }
            }
            Err(e) => {
                self.status_message = Some(format!("Call setup problem: {}", e));
            }
        }
    }

    /// Unconditional teardown: timers, tracks, connection, counters, grant.
    async fn end_call(&mut self, reason: EndReason, notify_remote: bool) {
        if notify_remote && self.session.is_active() {
            self.send_signal(SignalEvent::Control {
                session_id: self.session_id.clone(),
                action: ControlAction::End,
            });
        }
        self.retry.cancel();
        self.recovery.reset();
        self.peer.release().await;
        self.peer_events = None;
        self.monitor.reset();
        self.grants.clear(&self.session_id);
        self.session.end(reason);
        self.publish();
    }

    fn send_signal(&self, event: SignalEvent) {
        if self.signal_tx.send(event).is_err() {
            tracing::warn!("Signaling sender gone (session {})", self.session_id);
        }
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            state: self.session.state().as_str().to_string(),
            launch_stage: self.session.launch_stage(),
            quality: self.monitor.tier(),
            diagnostics: self.monitor.diagnostics().clone(),
            muted: self.session.muted,
            camera_on: self.session.camera_on,
            remote_muted: self.session.remote_muted,
            accepted_mode: self
                .session
                .accepted_mode
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            started_at: self.session.started_at(),
            status_message: self.status_message.clone(),
            messages: self.chat.messages().to_vec(),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}

async fn recv_peer_event(
    events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>,
) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::alerts::ChannelAlertSink;
    use super::bandwidth::{CaptureProfile, DeviceClass, IceTransportPolicy};
    use super::peer::{
        CaptureError, LocalMedia, LocalTrack, PeerConnection, PeerError, PeerStats, TrackKind,
    };

    /// Shared control handle: records connection policies and applied
    /// candidates, and lets a test inject peer events into the most recent
    /// connection.
    #[derive(Default)]
    struct RuntimeControl {
        policies: StdMutex<Vec<IceTransportPolicy>>,
        captures: StdMutex<Vec<bool>>,
        candidates: StdMutex<Vec<String>>,
        event_txs: StdMutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    }

    impl RuntimeControl {
        fn push_peer_event(&self, event: PeerEvent) {
            let txs = self.event_txs.lock().unwrap();
            let tx = txs.last().expect("no connection created yet");
            let _ = tx.send(event);
        }

        fn policies(&self) -> Vec<IceTransportPolicy> {
            self.policies.lock().unwrap().clone()
        }

        fn captures(&self) -> Vec<bool> {
            self.captures.lock().unwrap().clone()
        }

        fn candidates(&self) -> Vec<String> {
            self.candidates.lock().unwrap().clone()
        }
    }

    struct TestConn {
        ctrl: Arc<RuntimeControl>,
        events_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    }

    impl PeerConnection for TestConn {
        async fn create_offer(&mut self) -> Result<String, PeerError> {
            Ok("v=0 test-offer".into())
        }

        async fn create_answer(&mut self) -> Result<String, PeerError> {
            Ok("v=0 test-answer".into())
        }

        async fn set_local_description(&mut self, _sdp: &str) -> Result<(), PeerError> {
            Ok(())
        }

        async fn set_remote_description(&mut self, _sdp: &str) -> Result<(), PeerError> {
            Ok(())
        }

        async fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), PeerError> {
            self.ctrl
                .candidates
                .lock()
                .unwrap()
                .push(candidate.to_string());
            Ok(())
        }

        async fn add_track(&mut self, _track: &LocalTrack) -> Result<(), PeerError> {
            Ok(())
        }

        async fn remove_tracks(&mut self) {}

        async fn sample_stats(&mut self) -> Result<PeerStats, PeerError> {
            Ok(PeerStats {
                rtt_ms: 50.0,
                jitter_ms: 2.0,
                packet_loss_pct: 0.0,
                local_candidate: None,
                remote_candidate: None,
            })
        }

        fn connection_state(&self) -> PeerConnState {
            PeerConnState::Connected
        }

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
            self.events_rx.take()
        }

        fn close(&mut self) {}
    }

    struct TestRuntime {
        ctrl: Arc<RuntimeControl>,
    }

    impl MediaRuntime for TestRuntime {
        type Conn = TestConn;

        async fn new_connection(
            &self,
            policy: IceTransportPolicy,
        ) -> Result<TestConn, PeerError> {
            self.ctrl.policies.lock().unwrap().push(policy);
            let (tx, rx) = mpsc::unbounded_channel();
            self.ctrl.event_txs.lock().unwrap().push(tx);
            Ok(TestConn {
                ctrl: Arc::clone(&self.ctrl),
                events_rx: Some(rx),
            })
        }

        async fn capture(
            &self,
            video: Option<&CaptureProfile>,
        ) -> Result<LocalMedia, CaptureError> {
            self.ctrl.captures.lock().unwrap().push(video.is_some());
            Ok(LocalMedia {
                audio: LocalTrack {
                    id: "a".into(),
                    kind: TrackKind::Audio,
                },
                video: video.map(|_| LocalTrack {
                    id: "v".into(),
                    kind: TrackKind::Video,
                }),
            })
        }
    }

    struct Harness {
        intents: mpsc::Sender<SessionIntent>,
        signals: broadcast::Sender<ChannelEvent>,
        out_rx: mpsc::UnboundedReceiver<SignalEvent>,
        snapshots: watch::Receiver<SessionSnapshot>,
        alerts_rx: mpsc::UnboundedReceiver<Alert>,
        ctrl: Arc<RuntimeControl>,
        grants: Arc<AccessGrants>,
    }

    fn spawn_driver(role: SenderRole, adaptation: BandwidthAdaptationPolicy) -> Harness {
        let ctrl = Arc::new(RuntimeControl::default());
        let grants = Arc::new(AccessGrants::new());
        let (alert_sink, alerts_rx) = ChannelAlertSink::new();
        let (signal_tx, out_rx) = mpsc::unbounded_channel();
        let (intents_tx, intents_rx) = mpsc::channel(16);
        let (signals_tx, signals_rx) = broadcast::channel(64);

        let (driver, snapshots) = SessionDriver::new(
            "s1",
            "Ana",
            role,
            TestRuntime {
                ctrl: Arc::clone(&ctrl),
            },
            adaptation,
            signal_tx,
            Arc::new(alert_sink),
            Arc::clone(&grants),
        );
        tokio::spawn(driver.run(intents_rx, signals_rx));

        Harness {
            intents: intents_tx,
            signals: signals_tx,
            out_rx,
            snapshots,
            alerts_rx,
            ctrl,
            grants,
        }
    }

    fn desktop() -> BandwidthAdaptationPolicy {
        BandwidthAdaptationPolicy::new(DeviceClass::Desktop, false)
    }

    fn joined() -> ChannelEvent {
        ChannelEvent::Signal(SignalEvent::Joined { sid: "s1".into() })
    }

    fn answer() -> ChannelEvent {
        ChannelEvent::Signal(SignalEvent::Answer {
            session_id: "s1".into(),
            sdp: "v=0 remote-answer".into(),
        })
    }

    async fn next_out(h: &mut Harness) -> SignalEvent {
        time::timeout(Duration::from_secs(30), h.out_rx.recv())
            .await
            .expect("timed out waiting for outbound event")
            .expect("outbound channel closed")
    }

    async fn wait_state(h: &mut Harness, want: &str) {
        time::timeout(Duration::from_secs(30), async {
            loop {
                if h.snapshots.borrow().state == want {
                    return;
                }
                h.snapshots.changed().await.expect("driver gone");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached state {}", want));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_offer_answer_connected() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();

        let offer = next_out(&mut h).await;
        match offer {
            SignalEvent::Offer { retry_attempt, .. } => assert!(retry_attempt.is_none()),
            other => panic!("expected offer, got {:?}", other),
        }
        wait_state(&mut h, "ringing").await;

        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;
        assert!(h.grants.is_granted("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_queued_until_room_joined() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        wait_state(&mut h, "waiting").await;

        h.signals.send(joined()).unwrap();
        let offer = next_out(&mut h).await;
        assert!(matches!(offer, SignalEvent::Offer { .. }));
        wait_state(&mut h, "ringing").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_call_does_not_send_second_offer() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        wait_state(&mut h, "ringing").await;

        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        // A marker intent proves nothing was queued in between.
        h.intents
            .send(SessionIntent::SetMuted(true))
            .await
            .unwrap();
        match next_out(&mut h).await {
            SignalEvent::Control { action, .. } => assert_eq!(action, ControlAction::Mute),
            other => panic!("unexpected outbound event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_retries_then_marks_degraded() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));

        for expected in 1..=3u32 {
            match next_out(&mut h).await {
                SignalEvent::Offer {
                    retry_attempt, sdp, ..
                } => {
                    assert_eq!(retry_attempt, Some(expected));
                    assert_eq!(sdp, "v=0 test-offer");
                }
                other => panic!("expected retry offer, got {:?}", other),
            }
        }

        let alert = time::timeout(Duration::from_secs(60), h.alerts_rx.recv())
            .await
            .expect("no degraded alert")
            .expect("alert channel closed");
        assert_eq!(
            alert,
            Alert::NetworkDegraded {
                session_id: "s1".into()
            }
        );
        // The call stays ringing for the human to decide.
        assert_eq!(h.snapshots.borrow().state, "ringing");
        assert_eq!(h.snapshots.borrow().quality, QualityTier::Slow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_cancels_retries() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        wait_state(&mut h, "ringing").await;

        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;

        // With retries cancelled, the next outbound event is our marker.
        h.intents
            .send(SessionIntent::SetMuted(true))
            .await
            .unwrap();
        match next_out(&mut h).await {
            SignalEvent::Control { action, .. } => assert_eq!(action, ControlAction::Mute),
            other => panic!("retry leaked after answer: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_forces_relay_audio_only_then_ends() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: true })
            .await
            .unwrap();
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;
        assert_eq!(h.ctrl.captures(), vec![true]);

        // First failure: relay + audio-only re-offer.
        h.ctrl.push_peer_event(PeerEvent::ConnectionState(PeerConnState::Failed));
        let reoffer = next_out(&mut h).await;
        assert!(matches!(reoffer, SignalEvent::Offer { .. }));
        wait_state(&mut h, "reconnecting").await;
        assert_eq!(
            h.ctrl.policies(),
            vec![IceTransportPolicy::All, IceTransportPolicy::Relay]
        );
        assert_eq!(h.ctrl.captures(), vec![true, false]);

        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;

        // Second failure: one more recovery attempt remains.
        h.ctrl.push_peer_event(PeerEvent::ConnectionState(PeerConnState::Failed));
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;

        // Third failure: budget exhausted, the call ends.
        h.ctrl.push_peer_event(PeerEvent::ConnectionState(PeerConnState::Failed));
        match next_out(&mut h).await {
            SignalEvent::Control { action, .. } => assert_eq!(action, ControlAction::End),
            other => panic!("expected end control, got {:?}", other),
        }
        wait_state(&mut h, "ended").await;
        assert!(!h.grants.is_granted("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_rings_buffers_candidates_and_connects() {
        let mut h = spawn_driver(SenderRole::Resident, desktop());
        h.signals.send(joined()).unwrap();
        h.signals
            .send(ChannelEvent::Signal(SignalEvent::Offer {
                session_id: "s1".into(),
                sdp: "v=0 remote-offer".into(),
                retry_attempt: None,
            }))
            .unwrap();
        wait_state(&mut h, "incoming").await;
        assert!(h.grants.is_granted("s1"));

        let alert = time::timeout(Duration::from_secs(30), h.alerts_rx.recv())
            .await
            .expect("no incoming alert")
            .expect("alert channel closed");
        assert!(matches!(alert, Alert::IncomingCall { .. }));

        // Early candidates arrive before the local accept.
        for c in ["candidate:c1", "candidate:c2"] {
            h.signals
                .send(ChannelEvent::Signal(SignalEvent::Ice {
                    session_id: "s1".into(),
                    candidate: c.into(),
                }))
                .unwrap();
        }

        h.intents.send(SessionIntent::AcceptCall).await.unwrap();
        match next_out(&mut h).await {
            SignalEvent::Answer { sdp, .. } => assert_eq!(sdp, "v=0 test-answer"),
            other => panic!("expected answer, got {:?}", other),
        }
        // Buffered candidates were applied in arrival order after the
        // remote description.
        assert_eq!(h.ctrl.candidates(), vec!["candidate:c1", "candidate:c2"]);

        h.ctrl
            .push_peer_event(PeerEvent::ConnectionState(PeerConnState::Connected));
        wait_state(&mut h, "connected").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_bandwidth_mobile_video_demoted_to_audio() {
        let adaptation = BandwidthAdaptationPolicy::new(DeviceClass::Mobile, true);
        let mut h = spawn_driver(SenderRole::Resident, adaptation);
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: true })
            .await
            .unwrap();

        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        // Audio-only capture was requested; no video track exists.
        assert_eq!(h.ctrl.captures(), vec![false]);
        assert!(!h.snapshots.borrow().camera_on);
        // Low-bandwidth mode also routes through relays.
        assert_eq!(h.ctrl.policies(), vec![IceTransportPolicy::Relay]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_notifies_and_releases() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;

        h.intents.send(SessionIntent::HangUp).await.unwrap();
        match next_out(&mut h).await {
            SignalEvent::Control { action, .. } => assert_eq!(action, ControlAction::End),
            other => panic!("expected end control, got {:?}", other),
        }
        wait_state(&mut h, "ended").await;
        assert!(!h.grants.is_granted("s1"));
        assert!(h.snapshots.borrow().diagnostics.rtt_ms.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_control_ends_call() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;

        h.signals
            .send(ChannelEvent::Signal(SignalEvent::Control {
                session_id: "s1".into(),
                action: ControlAction::End,
            }))
            .unwrap();
        wait_state(&mut h, "ended").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_send_echo_persisted_via_driver() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.intents
            .send(SessionIntent::SendMessage {
                text: "Hello".into(),
            })
            .await
            .unwrap();

        let client_id = match next_out(&mut h).await {
            SignalEvent::ChatMessage {
                text, client_id, ..
            } => {
                assert_eq!(text, "Hello");
                client_id
            }
            other => panic!("expected chat message, got {:?}", other),
        };

        h.signals
            .send(ChannelEvent::Signal(SignalEvent::ChatMessage {
                session_id: "s1".into(),
                text: "Hello".into(),
                display_name: "Ana".into(),
                sender_type: SenderRole::Visitor,
                client_id: client_id.clone(),
            }))
            .unwrap();
        h.signals
            .send(ChannelEvent::Signal(SignalEvent::ChatPersisted {
                session_id: "s1".into(),
                id: "m1".into(),
                client_id,
            }))
            .unwrap();

        time::timeout(Duration::from_secs(30), async {
            loop {
                {
                    let snap = h.snapshots.borrow();
                    if snap.messages.len() == 1 && snap.messages[0].persisted {
                        assert_eq!(snap.messages[0].id.as_deref(), Some("m1"));
                        return;
                    }
                }
                h.snapshots.changed().await.expect("driver gone");
            }
        })
        .await
        .expect("message never settled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_drop_degrades_quality_not_call() {
        let mut h = spawn_driver(SenderRole::Visitor, desktop());
        h.signals.send(joined()).unwrap();
        h.intents
            .send(SessionIntent::StartCall { wants_video: false })
            .await
            .unwrap();
        assert!(matches!(next_out(&mut h).await, SignalEvent::Offer { .. }));
        h.signals.send(answer()).unwrap();
        wait_state(&mut h, "connected").await;

        h.signals
            .send(ChannelEvent::Transport(TransportStatus::Disconnected))
            .unwrap();
        time::timeout(Duration::from_secs(30), async {
            loop {
                if h.snapshots.borrow().quality == QualityTier::Reconnecting {
                    return;
                }
                h.snapshots.changed().await.expect("driver gone");
            }
        })
        .await
        .expect("quality never degraded");
        // The call survives the transport wobble.
        assert_eq!(h.snapshots.borrow().state, "connected");
    }
}
