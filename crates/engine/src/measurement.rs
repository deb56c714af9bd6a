//! Ranging measurements forwarded from an adapter (or the fusion filter) up
//! through a [`Session`](crate::session::Session) to the caller.

use crate::peer::PeerId;
use codec::Technology;

/// Confidence the adapter (or fusion filter) attaches to a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// One ranging result for one peer at one instant.
///
/// Distance is the only mandatory field; `azimuth_deg`/`elevation_deg` are
/// `None` when the technology or this particular round didn't produce an
/// angular reading. `distance_m` is `NaN` when the round produced no
/// distance at all (e.g. an RSSI-only proximity blip) — spec §3 requires
/// that *if reported*, distance is finite, so callers must check
/// `distance_m.is_finite()` before using it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangingMeasurement {
    pub technology: Technology,
    pub peer: PeerId,
    pub distance_m: f64,
    pub azimuth_deg: Option<f64>,
    pub elevation_deg: Option<f64>,
    pub rssi: Option<i16>,
    pub timestamp_ns: u64,
    pub confidence: Confidence,
}

impl RangingMeasurement {
    /// True unless the reported distance is non-`NaN` but non-finite
    /// (infinite), which would violate spec §3's invariant.
    pub fn is_well_formed(&self) -> bool {
        self.distance_m.is_nan() || self.distance_m.is_finite()
    }
}

/// Tracks the last timestamp seen per peer so the session can enforce the
/// "non-decreasing timestamp per (session, peer)" invariant of spec §3/§8.
#[derive(Default)]
pub struct TimestampGuard {
    last_ns: ahash::AHashMap<PeerId, u64>,
}

impl TimestampGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `ts` is acceptable (and records it), `false` if it
    /// would violate monotonicity for this peer.
    pub fn accept(&mut self, peer: PeerId, ts: u64) -> bool {
        match self.last_ns.get(&peer) {
            Some(&last) if ts < last => false,
            _ => {
                self.last_ns.insert(peer, ts);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(distance_m: f64) -> RangingMeasurement {
        RangingMeasurement {
            technology: Technology::Uwb,
            peer: PeerId::from_u128(1),
            distance_m,
            azimuth_deg: None,
            elevation_deg: None,
            rssi: None,
            timestamp_ns: 0,
            confidence: Confidence::High,
        }
    }

    #[test]
    fn finite_and_nan_distances_are_well_formed() {
        assert!(measurement(1.5).is_well_formed());
        assert!(measurement(f64::NAN).is_well_formed());
    }

    #[test]
    fn infinite_distance_is_not_well_formed() {
        assert!(!measurement(f64::INFINITY).is_well_formed());
        assert!(!measurement(f64::NEG_INFINITY).is_well_formed());
    }

    #[test]
    fn timestamp_guard_rejects_regression_per_peer() {
        let mut guard = TimestampGuard::new();
        let peer = PeerId::from_u128(1);
        assert!(guard.accept(peer, 100));
        assert!(guard.accept(peer, 150));
        assert!(!guard.accept(peer, 120));
    }

    #[test]
    fn timestamp_guard_tracks_each_peer_independently() {
        let mut guard = TimestampGuard::new();
        let a = PeerId::from_u128(1);
        let b = PeerId::from_u128(2);
        assert!(guard.accept(a, 500));
        // A fresh peer starts with no recorded timestamp, so an earlier
        // value than `a`'s is still accepted.
        assert!(guard.accept(b, 10));
    }
}
