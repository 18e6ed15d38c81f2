//! Call lifecycle state machine.
//!
//! The state is a tagged union: per-state data (the pending offer, the
//! remote offer awaiting acceptance, the recovery attempt) lives inside the
//! variant that needs it, so "negotiation in progress" is not a side-flag
//! but a shape of the state itself. Only one outstanding local offer can
//! exist because only one variant can hold it.

use chrono::{DateTime, Utc};

/// Which side of the call this endpoint is on for the current call.
/// Recovery is asymmetric: only the caller re-negotiates after failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Audio,
    Video,
}

impl CallMode {
    pub fn from_video_flag(wants_video: bool) -> Self {
        if wants_video {
            CallMode::Video
        } else {
            CallMode::Audio
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallMode::Audio => "audio",
            CallMode::Video => "video",
        }
    }
}

/// Why a call reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    RecoveryExhausted,
}

/// The last locally-sent SDP offer plus its resend count. Single-slot:
/// cleared on answer receipt or call end.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOffer {
    pub sdp: String,
    pub retry_attempt: u32,
}

/// UI-facing launch progress while a call is being set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    Idle,
    Preparing,
    Waiting,
    Signaling,
    Ringing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallState {
    Idle,
    /// Local intent to call recorded; media not yet attached.
    Preparing { wants_video: bool },
    /// Signaling room not joined yet; the intended call resumes on join.
    Waiting { wants_video: bool },
    /// Local media attached, offer being created.
    Signaling { wants_video: bool },
    /// Offer sent, waiting for the answer. Carries the offer for resends.
    Ringing { pending: PendingOffer },
    /// Remote offer received; waiting for the local accept/reject.
    Incoming { remote_sdp: String, wants_video: bool },
    Connected { mode: CallMode },
    /// Peer connection lost; a forced-relay audio-only re-offer is in flight.
    Reconnecting { attempt: u32 },
    Ended { reason: EndReason },
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Preparing { .. } => "preparing",
            CallState::Waiting { .. } => "waiting",
            CallState::Signaling { .. } => "signaling",
            CallState::Ringing { .. } => "ringing",
            CallState::Incoming { .. } => "incoming",
            CallState::Connected { .. } => "connected",
            CallState::Reconnecting { .. } => "reconnecting",
            CallState::Ended { .. } => "ended",
        }
    }
}

/// Outcome of a local start-call intent.
#[derive(Debug, PartialEq)]
pub enum StartOutcome {
    /// Proceed to media attach + offer creation now.
    Proceed { wants_video: bool },
    /// Room not joined yet; the call is queued and resumes on join.
    Queued,
    /// A call is already in progress; the intent is a no-op.
    Rejected,
}

/// How to treat a remote `webrtc.offer`.
#[derive(Debug, PartialEq)]
pub enum OfferDisposition {
    /// Fresh incoming call: surface it and ring.
    Ring,
    /// Renegotiation of the established call (recovery re-offer): answer
    /// it without ringing.
    Renegotiate,
    /// Glare or stale: a negotiation of ours is already outstanding.
    Ignored,
}

/// Authoritative per-session call state plus the media/adaptation flags the
/// UI renders.
#[derive(Debug)]
pub struct CallSession {
    state: CallState,
    role: CallRole,
    /// Set when the current call intent was recorded; drives elapsed-time UI.
    started_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub camera_on: bool,
    pub remote_muted: bool,
    pub accepted_mode: Option<CallMode>,
    pub offer_retry_count: u32,
    pub recovery_count: u32,
    pub force_relay: bool,
    pub low_bandwidth: bool,
    pub pending_video_upgrade: bool,
}

impl CallSession {
    pub fn new(low_bandwidth: bool) -> Self {
        Self {
            state: CallState::Idle,
            role: CallRole::Caller,
            started_at: None,
            muted: false,
            camera_on: false,
            remote_muted: false,
            accepted_mode: None,
            offer_retry_count: 0,
            recovery_count: 0,
            force_relay: false,
            low_bandwidth,
            pending_video_upgrade: false,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, CallState::Idle | CallState::Ended { .. })
    }

    pub fn launch_stage(&self) -> LaunchStage {
        match &self.state {
            CallState::Preparing { .. } => LaunchStage::Preparing,
            CallState::Waiting { .. } => LaunchStage::Waiting,
            CallState::Signaling { .. } => LaunchStage::Signaling,
            CallState::Ringing { .. } | CallState::Incoming { .. } => LaunchStage::Ringing,
            _ => LaunchStage::Idle,
        }
    }

    /// Local intent to start a call.
    pub fn start_call(&mut self, wants_video: bool, room_joined: bool) -> StartOutcome {
        match self.state {
            CallState::Idle | CallState::Ended { .. } => {
                self.reset_call_fields();
                self.role = CallRole::Caller;
                self.started_at = Some(Utc::now());
                if room_joined {
                    self.state = CallState::Preparing { wants_video };
                    StartOutcome::Proceed { wants_video }
                } else {
                    self.state = CallState::Waiting { wants_video };
                    StartOutcome::Queued
                }
            }
            _ => StartOutcome::Rejected,
        }
    }

    /// The signaling room was joined. Returns the queued call intent, if any.
    pub fn room_joined(&mut self) -> Option<bool> {
        match self.state {
            CallState::Waiting { wants_video } => {
                self.state = CallState::Preparing { wants_video };
                Some(wants_video)
            }
            _ => None,
        }
    }

    /// Move into offer creation. Returns `false` (no-op) when a prior
    /// negotiation is still outstanding — the single-offer guard.
    pub fn begin_negotiation(&mut self, wants_video: bool) -> bool {
        match self.state {
            CallState::Preparing { .. } | CallState::Waiting { .. } => {
                self.accepted_mode = Some(CallMode::from_video_flag(wants_video));
                self.state = CallState::Signaling { wants_video };
                true
            }
            // A recovery re-offer negotiates from Reconnecting itself.
            CallState::Reconnecting { .. } => {
                self.accepted_mode = Some(CallMode::from_video_flag(wants_video));
                true
            }
            _ => false,
        }
    }

    /// The offer went out on the wire.
    pub fn offer_sent(&mut self, sdp: String) {
        if let CallState::Signaling { .. } = self.state {
            self.state = CallState::Ringing {
                pending: PendingOffer {
                    sdp,
                    retry_attempt: 0,
                },
            };
        }
    }

    /// Record one offer resend; returns the offer to resend with its new
    /// attempt number, or `None` when no offer is pending.
    pub fn record_offer_retry(&mut self) -> Option<PendingOffer> {
        if let CallState::Ringing { pending } = &mut self.state {
            pending.retry_attempt += 1;
            self.offer_retry_count = pending.retry_attempt;
            return Some(pending.clone());
        }
        None
    }

    /// Classify a remote offer against the current state.
    pub fn remote_offer_received(&mut self, sdp: String, wants_video: bool) -> OfferDisposition {
        match self.state {
            CallState::Idle | CallState::Ended { .. } => {
                self.reset_call_fields();
                self.role = CallRole::Callee;
                self.started_at = Some(Utc::now());
                self.state = CallState::Incoming {
                    remote_sdp: sdp,
                    wants_video,
                };
                OfferDisposition::Ring
            }
            CallState::Connected { .. } | CallState::Reconnecting { .. } => {
                if self.role == CallRole::Callee {
                    self.force_relay = true;
                    self.state = CallState::Reconnecting { attempt: 0 };
                    OfferDisposition::Renegotiate
                } else {
                    OfferDisposition::Ignored
                }
            }
            _ => OfferDisposition::Ignored,
        }
    }

    /// Take the remote offer to answer it. Marks the call accepted; the
    /// state stays `Incoming` until the peer connection reports connected.
    pub fn accept_incoming(&mut self) -> Option<(String, bool)> {
        if let CallState::Incoming {
            remote_sdp,
            wants_video,
        } = &self.state
        {
            let out = (remote_sdp.clone(), *wants_video);
            self.accepted_mode = Some(CallMode::from_video_flag(*wants_video));
            Some(out)
        } else {
            None
        }
    }

    /// An SDP answer arrived for our outstanding offer. Clears the pending
    /// slot and resets the retry counter. Returns `false` for stale answers.
    pub fn answer_received(&mut self) -> bool {
        match self.state {
            CallState::Ringing { .. } | CallState::Reconnecting { .. } => {
                let mode = self.accepted_mode.unwrap_or(CallMode::Audio);
                self.state = CallState::Connected { mode };
                self.offer_retry_count = 0;
                true
            }
            _ => false,
        }
    }

    /// The peer connection reached `connected` (callee path, and recovery).
    pub fn peer_connected(&mut self) -> bool {
        match self.state {
            CallState::Incoming { .. } | CallState::Reconnecting { .. } => {
                let mode = self.accepted_mode.unwrap_or(CallMode::Audio);
                self.state = CallState::Connected { mode };
                true
            }
            _ => false,
        }
    }

    /// Enter recovery after a peer-connection failure.
    pub fn enter_reconnecting(&mut self, attempt: u32) {
        self.recovery_count = attempt;
        self.force_relay = true;
        self.state = CallState::Reconnecting { attempt };
    }

    /// Unconditional end. Returns whether the call was active (resources to
    /// release).
    pub fn end(&mut self, reason: EndReason) -> bool {
        let was_active = self.is_active();
        self.state = CallState::Ended { reason };
        self.reset_call_fields();
        was_active
    }

    /// `Ended → Idle` when the session view is reused for a new call.
    pub fn reset_to_idle(&mut self) {
        if matches!(self.state, CallState::Ended { .. }) {
            self.state = CallState::Idle;
        }
    }

    fn reset_call_fields(&mut self) {
        self.started_at = None;
        self.muted = false;
        self.camera_on = false;
        self.remote_muted = false;
        self.accepted_mode = None;
        self.offer_retry_count = 0;
        self.recovery_count = 0;
        self.force_relay = false;
        self.pending_video_upgrade = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller_ringing() -> CallSession {
        let mut s = CallSession::new(false);
        assert_eq!(
            s.start_call(false, true),
            StartOutcome::Proceed { wants_video: false }
        );
        assert!(s.begin_negotiation(false));
        s.offer_sent("v=0 offer".into());
        s
    }

    #[test]
    fn test_happy_path_caller() {
        let mut s = caller_ringing();
        assert_eq!(s.state().as_str(), "ringing");
        assert_eq!(s.launch_stage(), LaunchStage::Ringing);
        assert!(s.answer_received());
        assert_eq!(s.state().as_str(), "connected");
        assert_eq!(s.launch_stage(), LaunchStage::Idle);
    }

    #[test]
    fn test_start_is_queued_until_room_joined() {
        let mut s = CallSession::new(false);
        assert_eq!(s.start_call(true, false), StartOutcome::Queued);
        assert_eq!(s.launch_stage(), LaunchStage::Waiting);
        assert_eq!(s.room_joined(), Some(true));
        assert_eq!(s.launch_stage(), LaunchStage::Preparing);
    }

    #[test]
    fn test_second_offer_attempt_is_noop() {
        let mut s = caller_ringing();
        // A second negotiation while one is outstanding must not start.
        assert!(!s.begin_negotiation(false));
        assert_eq!(s.state().as_str(), "ringing");
    }

    #[test]
    fn test_start_during_active_call_is_rejected() {
        let mut s = caller_ringing();
        assert_eq!(s.start_call(true, true), StartOutcome::Rejected);
    }

    #[test]
    fn test_remote_offer_while_idle_rings() {
        let mut s = CallSession::new(false);
        let d = s.remote_offer_received("v=0".into(), true);
        assert_eq!(d, OfferDisposition::Ring);
        assert_eq!(s.role(), CallRole::Callee);
        assert_eq!(s.launch_stage(), LaunchStage::Ringing);

        let (sdp, wants_video) = s.accept_incoming().unwrap();
        assert_eq!(sdp, "v=0");
        assert!(wants_video);
        // Connected only once the peer connection reports it.
        assert_eq!(s.state().as_str(), "incoming");
        assert!(s.peer_connected());
        assert_eq!(s.state().as_str(), "connected");
    }

    #[test]
    fn test_glare_offer_is_ignored() {
        let mut s = caller_ringing();
        let d = s.remote_offer_received("v=0 other".into(), false);
        assert_eq!(d, OfferDisposition::Ignored);
        assert_eq!(s.state().as_str(), "ringing");
    }

    #[test]
    fn test_renegotiation_offer_for_connected_callee() {
        let mut s = CallSession::new(false);
        s.remote_offer_received("v=0".into(), false);
        s.accept_incoming().unwrap();
        s.peer_connected();

        let d = s.remote_offer_received("v=0 retry".into(), false);
        assert_eq!(d, OfferDisposition::Renegotiate);
        assert_eq!(s.state().as_str(), "reconnecting");
        assert!(s.peer_connected());
    }

    #[test]
    fn test_retry_increments_slot_and_counter() {
        let mut s = caller_ringing();
        let p1 = s.record_offer_retry().unwrap();
        assert_eq!(p1.retry_attempt, 1);
        let p2 = s.record_offer_retry().unwrap();
        assert_eq!(p2.retry_attempt, 2);
        assert_eq!(p2.sdp, "v=0 offer");
        assert_eq!(s.offer_retry_count, 2);

        assert!(s.answer_received());
        assert_eq!(s.offer_retry_count, 0);
        assert!(s.record_offer_retry().is_none());
    }

    #[test]
    fn test_end_from_any_state_resets_counters() {
        let mut s = caller_ringing();
        s.muted = true;
        s.record_offer_retry();
        assert!(s.end(EndReason::RemoteHangup));
        assert_eq!(
            *s.state(),
            CallState::Ended {
                reason: EndReason::RemoteHangup
            }
        );
        assert!(!s.muted);
        assert_eq!(s.offer_retry_count, 0);
        assert!(s.started_at().is_none());

        // Ended is terminal-at-rest but a new call restarts from it.
        s.reset_to_idle();
        assert_eq!(*s.state(), CallState::Idle);
        assert_eq!(
            s.start_call(false, true),
            StartOutcome::Proceed { wants_video: false }
        );
    }

    #[test]
    fn test_recovery_transition_forces_relay() {
        let mut s = caller_ringing();
        s.answer_received();
        s.enter_reconnecting(1);
        assert_eq!(s.state().as_str(), "reconnecting");
        assert!(s.force_relay);
        assert_eq!(s.recovery_count, 1);
        // The re-offer negotiates from Reconnecting without a state change.
        assert!(s.begin_negotiation(false));
        assert!(s.answer_received());
        assert_eq!(s.state().as_str(), "connected");
    }
}
