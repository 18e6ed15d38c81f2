//! Capture and transport adaptation.
//!
//! Decides, before any capture is attempted: the video resolution/frame
//! rate tier, whether ICE is forced through relays, and whether a requested
//! video call is silently demoted to audio-only. Inputs are the quality
//! classification, the device class, and the user's persisted low-bandwidth
//! preference.

use serde::{Deserialize, Serialize};

use super::quality::QualityTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    ConstrainedMobile,
    Mobile,
    Desktop,
}

impl DeviceClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "constrained_mobile" | "constrained" => Some(DeviceClass::ConstrainedMobile),
            "mobile" => Some(DeviceClass::Mobile),
            "desktop" => Some(DeviceClass::Desktop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::ConstrainedMobile => "constrained_mobile",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Desktop => "desktop",
        }
    }
}

/// min/ideal/max bounds for one capture dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: u32,
    pub ideal: u32,
    pub max: u32,
}

const fn bounds(min: u32, ideal: u32, max: u32) -> Bounds {
    Bounds { min, ideal, max }
}

/// Video capture constraints for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureProfile {
    pub width: Bounds,
    pub height: Bounds,
    pub frame_rate: Bounds,
}

pub const CONSTRAINED_MOBILE_PROFILE: CaptureProfile = CaptureProfile {
    width: bounds(160, 320, 480),
    height: bounds(120, 240, 360),
    frame_rate: bounds(5, 10, 15),
};

pub const MOBILE_PROFILE: CaptureProfile = CaptureProfile {
    width: bounds(320, 640, 960),
    height: bounds(240, 480, 540),
    frame_rate: bounds(10, 15, 24),
};

pub const DESKTOP_PROFILE: CaptureProfile = CaptureProfile {
    width: bounds(640, 1280, 1920),
    height: bounds(360, 720, 1080),
    frame_rate: bounds(15, 30, 30),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceTransportPolicy {
    All,
    Relay,
}

/// What to capture and how to route, for one negotiation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaPlan {
    /// `None` means audio-only capture.
    pub video: Option<CaptureProfile>,
    pub ice_policy: IceTransportPolicy,
    /// True when a requested video call was demoted to audio-only.
    pub demoted: bool,
}

impl MediaPlan {
    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BandwidthAdaptationPolicy {
    pub device: DeviceClass,
    pub low_bandwidth: bool,
}

impl BandwidthAdaptationPolicy {
    pub fn new(device: DeviceClass, low_bandwidth: bool) -> Self {
        Self {
            device,
            low_bandwidth,
        }
    }

    /// Build the media plan for a negotiation. `force_relay` comes from the
    /// recovery policy and overrides the normal routing choice.
    pub fn plan(&self, wants_video: bool, tier: QualityTier, force_relay: bool) -> MediaPlan {
        let demote = wants_video && (self.low_bandwidth || tier == QualityTier::Reconnecting);

        let video = if wants_video && !demote {
            Some(self.profile_for(tier))
        } else {
            None
        };

        let ice_policy = if force_relay || self.low_bandwidth {
            IceTransportPolicy::Relay
        } else {
            IceTransportPolicy::All
        };

        MediaPlan {
            video,
            ice_policy,
            demoted: demote,
        }
    }

    /// Capture tier for the device, stepped down one tier on a slow network.
    fn profile_for(&self, tier: QualityTier) -> CaptureProfile {
        let slow = tier != QualityTier::Good;
        match self.device {
            DeviceClass::ConstrainedMobile => CONSTRAINED_MOBILE_PROFILE,
            DeviceClass::Mobile => {
                if slow {
                    CONSTRAINED_MOBILE_PROFILE
                } else {
                    MOBILE_PROFILE
                }
            }
            DeviceClass::Desktop => {
                if slow {
                    MOBILE_PROFILE
                } else {
                    DESKTOP_PROFILE
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_bandwidth_demotes_video_before_capture() {
        let policy = BandwidthAdaptationPolicy::new(DeviceClass::Mobile, true);
        let plan = policy.plan(true, QualityTier::Good, false);
        assert!(plan.video.is_none());
        assert!(plan.demoted);
        assert_eq!(plan.ice_policy, IceTransportPolicy::Relay);
    }

    #[test]
    fn test_audio_request_is_never_marked_demoted() {
        let policy = BandwidthAdaptationPolicy::new(DeviceClass::Mobile, true);
        let plan = policy.plan(false, QualityTier::Good, false);
        assert!(plan.video.is_none());
        assert!(!plan.demoted);
    }

    #[test]
    fn test_device_class_picks_capture_tier() {
        let desktop = BandwidthAdaptationPolicy::new(DeviceClass::Desktop, false);
        assert_eq!(
            desktop.plan(true, QualityTier::Good, false).video,
            Some(DESKTOP_PROFILE)
        );

        let mobile = BandwidthAdaptationPolicy::new(DeviceClass::Mobile, false);
        assert_eq!(
            mobile.plan(true, QualityTier::Good, false).video,
            Some(MOBILE_PROFILE)
        );

        let constrained = BandwidthAdaptationPolicy::new(DeviceClass::ConstrainedMobile, false);
        assert_eq!(
            constrained.plan(true, QualityTier::Good, false).video,
            Some(CONSTRAINED_MOBILE_PROFILE)
        );
    }

    #[test]
    fn test_slow_network_steps_profile_down() {
        let desktop = BandwidthAdaptationPolicy::new(DeviceClass::Desktop, false);
        assert_eq!(
            desktop.plan(true, QualityTier::Slow, false).video,
            Some(MOBILE_PROFILE)
        );

        let mobile = BandwidthAdaptationPolicy::new(DeviceClass::Mobile, false);
        assert_eq!(
            mobile.plan(true, QualityTier::Slow, false).video,
            Some(CONSTRAINED_MOBILE_PROFILE)
        );
    }

    #[test]
    fn test_worst_tier_demotes_to_audio() {
        let desktop = BandwidthAdaptationPolicy::new(DeviceClass::Desktop, false);
        let plan = desktop.plan(true, QualityTier::Reconnecting, false);
        assert!(plan.video.is_none());
        assert!(plan.demoted);
    }

    #[test]
    fn test_force_relay_overrides_routing() {
        let policy = BandwidthAdaptationPolicy::new(DeviceClass::Desktop, false);
        let plan = policy.plan(false, QualityTier::Good, true);
        assert_eq!(plan.ice_policy, IceTransportPolicy::Relay);
    }

    #[test]
    fn test_device_class_parse_roundtrip() {
        for d in [
            DeviceClass::ConstrainedMobile,
            DeviceClass::Mobile,
            DeviceClass::Desktop,
        ] {
            assert_eq!(DeviceClass::parse(d.as_str()), Some(d));
        }
        assert_eq!(DeviceClass::parse("toaster"), None);
    }
}
