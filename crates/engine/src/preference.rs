//! Caller-supplied preferences: the inputs to `Session::start` and, via
//! [`OobPreference`], to the Config Selector (spec §3, §4.2, §4.3).

use crate::error::RangingError;
use codec::{ConfigBlock, TechnologySet};

/// Device role for a ranging exchange (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Initiator,
    Responder,
}

/// Aggregated data-notification policy (spec §3). `near_cm <= far_cm` is
/// enforced by [`DataNotificationPolicy::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataNotificationPolicy {
    Disabled,
    Enabled,
    ProximityLevel { near_cm: u16, far_cm: u16 },
    ProximityEdge { near_cm: u16, far_cm: u16 },
}

impl Default for DataNotificationPolicy {
    fn default() -> Self {
        Self::Enabled
    }
}

impl DataNotificationPolicy {
    pub fn validate(&self) -> Result<(), RangingError> {
        match *self {
            Self::ProximityLevel { near_cm, far_cm } | Self::ProximityEdge { near_cm, far_cm } => {
                if near_cm > far_cm {
                    return Err(RangingError::InvalidConfig);
                }
                Ok(())
            }
            Self::Disabled | Self::Enabled => Ok(()),
        }
    }
}

/// What the caller wants out of OOB negotiation for one peer: which
/// technologies are acceptable and what ranging-interval range it can
/// tolerate (spec §4.3 step 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobPreference {
    /// Technologies the caller refuses to use, regardless of support.
    pub excluded_technologies: TechnologySet,
    /// Inclusive range, milliseconds, of acceptable ranging intervals.
    pub interval_range_ms: (u16, u16),
    /// Request the CS SECURE tier if all peers support it.
    pub cs_security_requested: bool,
}

impl Default for OobPreference {
    /// No exclusions, the widest possible interval range, no SECURE
    /// request: the most permissive preference that still validates.
    fn default() -> Self {
        Self {
            excluded_technologies: TechnologySet::empty(),
            interval_range_ms: (0, u16::MAX),
            cs_security_requested: false,
        }
    }
}

impl OobPreference {
    pub fn validate(&self) -> Result<(), RangingError> {
        if self.interval_range_ms.0 > self.interval_range_ms.1 {
            return Err(RangingError::InvalidConfig);
        }
        Ok(())
    }
}

/// Per-peer parameter bundle: either the caller hands us already-negotiated
/// parameters directly (`Raw`, no OOB round trip needed), or asks us to
/// negotiate over OOB (`Oob`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerStartKind {
    Raw(ConfigBlock),
    Oob(OobPreference),
}

/// The argument to `Session::start` (spec §4.2 "Public contract").
#[derive(Debug, Clone)]
pub struct StartPreference {
    pub role: DeviceRole,
    /// 0 = unbounded; otherwise a round count up to 65535 (spec §3, §8).
    pub measurement_limit: u32,
    pub notification_policy: DataNotificationPolicy,
    pub sensor_fusion: bool,
    pub aoa_requested: bool,
    pub peers: ahash::AHashMap<crate::peer::PeerId, PeerStartKind>,
}

impl StartPreference {
    pub fn validate(&self) -> Result<(), RangingError> {
        self.notification_policy.validate()?;

        if self.measurement_limit > 65535 {
            return Err(RangingError::InvalidConfig);
        }

        for kind in self.peers.values() {
            if let PeerStartKind::Oob(pref) = kind {
                pref.validate()?;
            }
        }

        Ok(())
    }
}
