//! Automatic re-negotiation after peer-connection loss.
//!
//! Recovery is asymmetric: only the call initiator re-offers, so the two
//! sides never produce duplicate competing offers. Each attempt forces
//! relay-only ICE and drops to audio — the failure already told us the
//! direct path or the bandwidth was not good enough.

use super::peer::PeerConnState;
use super::state::CallRole;

/// Re-negotiation attempts per call before giving up.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 2;

#[derive(Debug, PartialEq)]
pub enum RecoveryDecision {
    /// Re-negotiate: relay-only ICE, audio-only media, attempt number given.
    Recover { attempt: u32 },
    /// Budget exhausted or the connection is gone for good.
    EndCall,
    /// Not ours to handle (callee side, or a non-terminal state).
    Ignore,
}

#[derive(Debug)]
pub struct ConnectionRecoveryPolicy {
    max_attempts: u32,
    attempts: u32,
}

impl Default for ConnectionRecoveryPolicy {
    fn default() -> Self {
        Self::new(MAX_RECOVERY_ATTEMPTS)
    }
}

impl ConnectionRecoveryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the per-call budget (call end, or a fresh call).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Decide what to do about a terminal peer-connection state observed on
    /// an established call.
    pub fn on_peer_state(&mut self, state: PeerConnState, role: CallRole) -> RecoveryDecision {
        match state {
            PeerConnState::Closed => RecoveryDecision::EndCall,
            PeerConnState::Failed | PeerConnState::Disconnected => {
                if role != CallRole::Caller {
                    // The callee waits for the initiator's re-offer.
                    return RecoveryDecision::Ignore;
                }
                if self.attempts >= self.max_attempts {
                    return RecoveryDecision::EndCall;
                }
                self.attempts += 1;
                RecoveryDecision::Recover {
                    attempt: self.attempts,
                }
            }
            _ => RecoveryDecision::Ignore,
        }
    }
}
