//! Network quality classification and the diagnostics snapshot.
//!
//! While a peer connection exists its statistics are sampled on a fixed
//! interval; signaling-transport drops feed in as well. The classification
//! drives the bandwidth adaptation policy and the "slow network" hints in
//! the UI.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::peer::{CandidateKind, PeerConnState, PeerStats};
use crate::signaling::TransportStatus;

/// Statistics sampling cadence while a peer connection exists.
pub const STATS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Above these, quality drops one step.
const RISKY_RTT_MS: f64 = 350.0;
const RISKY_JITTER_MS: f64 = 30.0;
const RISKY_LOSS_PCT: f64 = 5.0;

/// Above these (or on a failed/disconnected ICE state), quality drops to
/// the worst tier.
const CRITICAL_RTT_MS: f64 = 800.0;
const CRITICAL_JITTER_MS: f64 = 80.0;
const CRITICAL_LOSS_PCT: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityTier {
    Good,
    Slow,
    Reconnecting,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Good => "good",
            QualityTier::Slow => "slow",
            QualityTier::Reconnecting => "reconnecting",
        }
    }
}

/// Point-in-time connection diagnostics. Empty until the first sample;
/// reset to empty when the peer connection is torn down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub connection_state: Option<PeerConnState>,
    pub signaling: Option<TransportStatus>,
    pub local_candidate: Option<CandidateKind>,
    pub remote_candidate: Option<CandidateKind>,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Classify one statistics sample against the thresholds.
fn classify(stats: &PeerStats, conn_state: PeerConnState) -> QualityTier {
    if matches!(
        conn_state,
        PeerConnState::Failed | PeerConnState::Disconnected
    ) {
        return QualityTier::Reconnecting;
    }
    if stats.rtt_ms >= CRITICAL_RTT_MS
        || stats.jitter_ms >= CRITICAL_JITTER_MS
        || stats.packet_loss_pct >= CRITICAL_LOSS_PCT
    {
        return QualityTier::Reconnecting;
    }
    if stats.rtt_ms >= RISKY_RTT_MS
        || stats.jitter_ms >= RISKY_JITTER_MS
        || stats.packet_loss_pct >= RISKY_LOSS_PCT
    {
        return QualityTier::Slow;
    }
    QualityTier::Good
}

#[derive(Debug, Default)]
pub struct NetworkQualityMonitor {
    diagnostics: Diagnostics,
    stats_tier: Option<QualityTier>,
    transport_down: bool,
    /// Set when the offer retry budget ran out — the network answered
    /// nothing, whatever the raw numbers say.
    degraded_hint: bool,
}

impl NetworkQualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Effective quality tier from the latest stats, transport state, and
    /// degradation hint.
    pub fn tier(&self) -> QualityTier {
        if self.transport_down {
            return QualityTier::Reconnecting;
        }
        let base = self.stats_tier.unwrap_or(QualityTier::Good);
        if self.degraded_hint {
            base.max(QualityTier::Slow)
        } else {
            base
        }
    }

    /// Fold in one statistics sample.
    pub fn on_stats(&mut self, stats: &PeerStats, conn_state: PeerConnState) -> QualityTier {
        self.diagnostics.connection_state = Some(conn_state);
        self.diagnostics.local_candidate = stats.local_candidate;
        self.diagnostics.remote_candidate = stats.remote_candidate;
        self.diagnostics.rtt_ms = Some(stats.rtt_ms);
        self.diagnostics.jitter_ms = Some(stats.jitter_ms);
        self.diagnostics.packet_loss_pct = Some(stats.packet_loss_pct);
        self.diagnostics.sampled_at = Some(Utc::now());
        self.stats_tier = Some(classify(stats, conn_state));
        self.tier()
    }

    /// Fold in a signaling-transport state change. Transport loss is a
    /// quality signal, never call termination.
    pub fn on_transport(&mut self, status: &TransportStatus) -> QualityTier {
        self.transport_down = !matches!(status, TransportStatus::Connected);
        self.diagnostics.signaling = Some(status.clone());
        self.tier()
    }

    /// The offer retry scheduler gave up: mark the network degraded.
    pub fn mark_degraded(&mut self) {
        self.degraded_hint = true;
    }

    /// Peer connection torn down: back to an empty snapshot.
    pub fn reset(&mut self) {
        let signaling = self.diagnostics.signaling.clone();
        self.diagnostics = Diagnostics {
            signaling,
            ..Diagnostics::default()
        };
        self.stats_tier = None;
        self.degraded_hint = false;
    }
}
