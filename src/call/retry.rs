//! Fixed-interval resend of an unacknowledged offer.
//!
//! The interval is constant, not exponential: the human on the other end is
//! either there or not, and a ringing call should keep probing at a steady
//! cadence. Exceeding the attempt budget stops the retries and marks the
//! network degraded; the call stays ringing so the user decides what next.

use std::time::Duration;

/// Delay between offer resends.
pub const OFFER_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum resends before the scheduler gives up.
pub const MAX_OFFER_RETRIES: u32 = 3;

#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    /// Resend the pending offer as attempt `attempt`.
    Resend { attempt: u32 },
    /// Budget exhausted: stop retrying, report the network as degraded.
    GiveUp,
    /// Nothing to do (not armed, or the call left `ringing`).
    Idle,
}

#[derive(Debug)]
pub struct OfferRetryScheduler {
    max_attempts: u32,
    armed: bool,
    attempts: u32,
    degraded: bool,
}

impl Default for OfferRetryScheduler {
    fn default() -> Self {
        Self::new(MAX_OFFER_RETRIES)
    }
}

impl OfferRetryScheduler {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            armed: false,
            attempts: 0,
            degraded: false,
        }
    }

    /// Arm after an offer is sent.
    pub fn arm(&mut self) {
        self.armed = true;
        self.attempts = 0;
        self.degraded = false;
    }

    /// Cancel on answer receipt or call termination.
    pub fn cancel(&mut self) {
        self.armed = false;
        self.attempts = 0;
    }

    /// Whether the budget was exhausted without an answer.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The interval timer fired. `still_ringing` is the fire-time state
    /// guard: a tick that lands after the call left `ringing` disarms the
    /// scheduler instead of resending.
    pub fn on_tick(&mut self, still_ringing: bool) -> RetryDecision {
        if !self.armed {
            return RetryDecision::Idle;
        }
        if !still_ringing {
            self.cancel();
            return RetryDecision::Idle;
        }
        if self.attempts >= self.max_attempts {
            self.armed = false;
            self.degraded = true;
            return RetryDecision::GiveUp;
        }
        self.attempts += 1;
        RetryDecision::Resend {
            attempt: self.attempts,
        }
    }
}
