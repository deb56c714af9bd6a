//! Config Selector (C3): pure, deterministic translation of (caller
//! preference, local capabilities, one peer's capabilities) into a
//! concrete per-technology parameter bundle, or a typed rejection (spec
//! §4.3).
//!
//! The distilled spec describes the algorithm as "build an intersection
//! across peers" for technologies like UWB, but the rest of §4.3 and the
//! data model (`Peer entry` carries its own `per-technology parameters`)
//! both key everything by peer. This port resolves that in favor of the
//! data model: [`select_for_peer`] runs the whole algorithm against one
//! peer's capabilities at a time, and a multi-peer session simply calls it
//! once per peer. See DESIGN.md for the full reasoning.

use crate::{capability::CapabilityDescriptor, error::RangingError, preference::OobPreference};
use codec::{
    CapabilityBlock, ConfigBlock, CsCapability, CsConfig, RssiCapability, RttCapability,
    RttConfig, SecurityLevel, Technology, UpdateRate, UwbCapability, UwbConfig, UwbConfigId,
};

/// Nominal interval, in milliseconds, each [`UpdateRate`] maps to. Shared by
/// UWB and (via its own three-entry subset in [`cs_interval_ms`]) CS, per
/// spec §4.3 step 2's UWB clause and the explicit CS table. The source
/// leaves the UWB table unstated; DESIGN.md records this as the resolved
/// value for an Open Question.
fn uwb_interval_ms(rate: UpdateRate) -> u16 {
    match rate {
        UpdateRate::Frequent => 50,
        UpdateRate::Fast => 100,
        UpdateRate::Normal => 200,
        UpdateRate::Infrequent => 5000,
    }
}

fn cs_interval_ms(rate: UpdateRate) -> Option<u16> {
    match rate {
        UpdateRate::Frequent => Some(100),
        UpdateRate::Normal => Some(200),
        UpdateRate::Infrequent => Some(5000),
        UpdateRate::Fast => None,
    }
}

/// Picks the highest-numbered [`UpdateRate`] (most frequent) whose nominal
/// interval falls within `range_ms` (inclusive), among the rates for which
/// `interval_of` returns `Some`.
fn highest_rate_in_range(
    range_ms: (u16, u16),
    interval_of: impl Fn(UpdateRate) -> Option<u16>,
) -> Option<UpdateRate> {
    [
        UpdateRate::Frequent,
        UpdateRate::Fast,
        UpdateRate::Normal,
        UpdateRate::Infrequent,
    ]
    .into_iter()
    .find(|&rate| match interval_of(rate) {
        Some(ms) => ms >= range_ms.0 && ms <= range_ms.1,
        None => false,
    })
}

/// The chosen technology and the parameter bundle for one peer. The same
/// bundle is handed to the local adapter's `start()` and framed into the
/// `SET_CONFIGURATION` sent to the peer: both sides range symmetrically
/// against the same channel/preamble/interval (documented in DESIGN.md).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSelection {
    pub technology: Technology,
    pub config: ConfigBlock,
}

/// Whether `tech`'s advertised interval ranges (UWB only; spec §3) overlap
/// each other and the caller's requested range. CS, RTT and RSSI carry no
/// interval range in their capability block and are always compatible here.
fn interval_compatible(
    tech: Technology,
    local: &CapabilityDescriptor,
    peer: &CapabilityDescriptor,
    pref: &OobPreference,
) -> bool {
    match (local.get(tech), peer.get(tech)) {
        (Some(CapabilityBlock::Uwb(l)), Some(CapabilityBlock::Uwb(p))) => {
            let lo = l.min_interval_ms.max(p.min_interval_ms);
            let hi = l.max_interval_ms.min(p.max_interval_ms);
            lo <= hi && lo <= pref.interval_range_ms.1 && hi >= pref.interval_range_ms.0
        }
        _ => true,
    }
}

fn select_uwb(local: &UwbCapability, peer: &UwbCapability, pref: &OobPreference) -> Option<ConfigBlock> {
    let channel = intersect_sorted(&local.channels, &peer.channels)?;
    let preamble = intersect_sorted(&local.preambles, &peer.preambles)?;
    let config_id = intersect_sorted(&local.config_ids, &peer.config_ids)
        .and_then(|v| UwbConfigId::from_u8(v).ok())?;

    let slot_mask = local.slot_duration_mask & peer.slot_duration_mask;
    let slot_duration_ms = if slot_mask & 0b01 != 0 {
        1
    } else if slot_mask & 0b10 != 0 {
        2
    } else {
        return None;
    };

    let lo = local.min_interval_ms.max(peer.min_interval_ms);
    let hi = local.max_interval_ms.min(peer.max_interval_ms);
    let range = (lo.max(pref.interval_range_ms.0), hi.min(pref.interval_range_ms.1));
    let update_rate = highest_rate_in_range(range, |r| Some(uwb_interval_ms(r)))?;

    let session_id = codec::fingerprint(&[&local.device_address[..], &[channel, preamble]].concat());

    Some(ConfigBlock::Uwb(UwbConfig {
        channel,
        preamble,
        config_id,
        slot_duration_ms,
        update_rate,
        device_address: local.device_address,
        session_id,
    }))
}

fn select_cs(local: &CsCapability, peer: &CsCapability, pref: &OobPreference) -> Option<ConfigBlock> {
    let both_secure = local.security_level_mask & peer.security_level_mask & 0b10 != 0;
    let both_basic = local.security_level_mask & peer.security_level_mask & 0b01 != 0;

    let security_level = if pref.cs_security_requested && both_secure {
        SecurityLevel::Secure
    } else if both_basic {
        SecurityLevel::Basic
    } else if both_secure {
        SecurityLevel::Secure
    } else {
        return None;
    };

    let rate_mask = local.update_rate_mask & peer.update_rate_mask;
    let update_rate = highest_rate_in_range(pref.interval_range_ms, |r| {
        if rate_mask & (1 << (r as u8)) == 0 {
            return None;
        }
        cs_interval_ms(r)
    })?;

    Some(ConfigBlock::Cs(CsConfig {
        security_level,
        update_rate,
        location_type: local.location_type,
        sight_type: local.sight_type,
    }))
}

fn select_rtt(local: &RttCapability, peer: &RttCapability) -> Option<ConfigBlock> {
    if local.service_name != peer.service_name {
        return None;
    }
    if local.max_bandwidth_mhz < peer.max_bandwidth_mhz {
        return None;
    }
    if local.rx_chains < peer.rx_chains {
        return None;
    }

    let match_filter = if local.match_filter == peer.match_filter {
        local.match_filter.clone()
    } else {
        local
            .match_filter
            .iter()
            .zip(peer.match_filter.iter())
            .map(|(a, b)| a & b)
            .collect()
    };

    Some(ConfigBlock::Rtt(RttConfig {
        service_name: local.service_name.clone(),
        match_filter,
        bandwidth_mhz: peer.max_bandwidth_mhz,
        rx_chains: peer.rx_chains,
    }))
}

fn select_rssi(peer: &RssiCapability) -> ConfigBlock {
    ConfigBlock::Rssi(RssiCapability {
        bluetooth_address: peer.bluetooth_address,
    })
}

/// Ascending-sorted intersection of two `u8` lists, returning the lowest
/// surviving element — the tie-break spec §4.3 mandates ("pick the
/// numerically lowest element of the intersection (deterministic)").
fn intersect_sorted(a: &[u8], b: &[u8]) -> Option<u8> {
    let mut candidates: Vec<u8> = a.iter().copied().filter(|x| b.contains(x)).collect();
    candidates.sort_unstable();
    candidates.first().copied()
}

/// Runs the full selection algorithm for one peer. Pure and deterministic:
/// identical arguments always yield a byte-identical [`PeerSelection`].
pub fn select_for_peer(
    local: &CapabilityDescriptor,
    peer: &CapabilityDescriptor,
    pref: &OobPreference,
) -> Result<PeerSelection, RangingError> {
    pref.validate()?;

    // Preference order is fixed and not configurable (spec §4.3 step 3).
    const ORDER: [Technology; 4] = [
        Technology::Uwb,
        Technology::Cs,
        Technology::Rtt,
        Technology::Rssi,
    ];

    let mut any_locally_supported = false;
    let mut any_mutually_supported = false;
    let mut any_interval_compatible = false;

    for tech in ORDER {
        if pref.excluded_technologies.contains(tech) {
            continue;
        }

        let local_supports = local.supports(tech);
        if local_supports {
            any_locally_supported = true;
        }
        if !local_supports || !peer.supports(tech) {
            continue;
        }
        any_mutually_supported = true;

        if !interval_compatible(tech, local, peer, pref) {
            continue;
        }
        any_interval_compatible = true;

        let built = match (local.get(tech), peer.get(tech)) {
            (Some(CapabilityBlock::Uwb(l)), Some(CapabilityBlock::Uwb(p))) => {
                select_uwb(l, p, pref)
            }
            (Some(CapabilityBlock::Cs(l)), Some(CapabilityBlock::Cs(p))) => select_cs(l, p, pref),
            (Some(CapabilityBlock::Rtt(l)), Some(CapabilityBlock::Rtt(p))) => select_rtt(l, p),
            (Some(CapabilityBlock::Rssi(_)), Some(CapabilityBlock::Rssi(p))) => {
                Some(select_rssi(p))
            }
            _ => None,
        };

        if let Some(config) = built {
            return Ok(PeerSelection { technology: tech, config });
        }
    }

    if !any_locally_supported {
        return Err(RangingError::Unsupported);
    }
    if !any_mutually_supported {
        return Err(RangingError::PeerCapabilitiesMismatch);
    }
    if !any_interval_compatible {
        return Err(RangingError::IncompatibleInterval);
    }

    // At least one technology cleared both the mutual-support and interval
    // gates, but no per-technology build produced a usable parameter
    // intersection (e.g. no common UWB channel/preamble/config id). That is
    // a capability mismatch, not an interval mismatch — see DESIGN.md.
    Err(RangingError::PeerCapabilitiesMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::TechnologySet;

    fn uwb_capability() -> CapabilityBlock {
        CapabilityBlock::Uwb(UwbCapability {
            channels: vec![9, 5],
            preambles: vec![11, 9],
            config_ids: vec![1, 2],
            slot_duration_mask: 0b11,
            min_interval_ms: 100,
            max_interval_ms: 5000,
            device_address: [0xab, 0xcd],
        })
    }

    fn base_pref() -> OobPreference {
        OobPreference {
            excluded_technologies: TechnologySet::empty(),
            interval_range_ms: (100, 5000),
            cs_security_requested: false,
        }
    }

    #[test]
    fn selects_uwb_deterministically_with_lowest_intersection_element() {
        let local = CapabilityDescriptor::new(vec![uwb_capability()]);
        let peer = CapabilityDescriptor::new(vec![uwb_capability()]);

        let result = select_for_peer(&local, &peer, &base_pref()).unwrap();
        assert_eq!(result.technology, Technology::Uwb);
        match result.config {
            ConfigBlock::Uwb(cfg) => {
                assert_eq!(cfg.channel, 5);
                assert_eq!(cfg.preamble, 9);
            }
            _ => panic!("expected uwb config"),
        }
    }

    #[test]
    fn is_deterministic_across_repeated_calls() {
        let local = CapabilityDescriptor::new(vec![uwb_capability()]);
        let peer = CapabilityDescriptor::new(vec![uwb_capability()]);
        let pref = base_pref();

        let a = select_for_peer(&local, &peer, &pref).unwrap();
        let b = select_for_peer(&local, &peer, &pref).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn falls_back_to_cs_when_uwb_excluded() {
        let cs = CapabilityBlock::Cs(CsCapability {
            security_level_mask: 0b01,
            update_rate_mask: 0b011,
            location_type: 0,
            sight_type: 0,
        });
        let local = CapabilityDescriptor::new(vec![uwb_capability(), cs.clone()]);
        let peer = CapabilityDescriptor::new(vec![uwb_capability(), cs]);

        let mut pref = base_pref();
        pref.excluded_technologies.insert(Technology::Uwb);

        let result = select_for_peer(&local, &peer, &pref).unwrap();
        assert_eq!(result.technology, Technology::Cs);
    }

    #[test]
    fn peer_capabilities_mismatch_when_peer_shares_nothing() {
        let local = CapabilityDescriptor::new(vec![uwb_capability()]);
        let peer = CapabilityDescriptor::new(vec![]);

        let err = select_for_peer(&local, &peer, &base_pref()).unwrap_err();
        assert_eq!(err, RangingError::PeerCapabilitiesMismatch);
    }

    #[test]
    fn unsupported_when_local_has_nothing() {
        let local = CapabilityDescriptor::new(vec![]);
        let peer = CapabilityDescriptor::new(vec![uwb_capability()]);

        let err = select_for_peer(&local, &peer, &base_pref()).unwrap_err();
        assert_eq!(err, RangingError::Unsupported);
    }

    #[test]
    fn incompatible_interval_is_rejected() {
        let local = CapabilityDescriptor::new(vec![uwb_capability()]);
        let peer = CapabilityDescriptor::new(vec![uwb_capability()]);

        let mut pref = base_pref();
        pref.interval_range_ms = (6000, 7000);

        let err = select_for_peer(&local, &peer, &pref).unwrap_err();
        assert_eq!(err, RangingError::IncompatibleInterval);
    }

    #[test]
    fn peer_capabilities_mismatch_when_gate_passes_but_build_fails() {
        let local = CapabilityDescriptor::new(vec![CapabilityBlock::Uwb(UwbCapability {
            channels: vec![5],
            preambles: vec![9],
            config_ids: vec![1],
            slot_duration_mask: 0b11,
            min_interval_ms: 100,
            max_interval_ms: 5000,
            device_address: [0xab, 0xcd],
        })]);
        let peer = CapabilityDescriptor::new(vec![CapabilityBlock::Uwb(UwbCapability {
            channels: vec![9],
            preambles: vec![9],
            config_ids: vec![1],
            slot_duration_mask: 0b11,
            min_interval_ms: 100,
            max_interval_ms: 5000,
            device_address: [0x11, 0x22],
        })]);

        // Intervals overlap so the interval gate passes, but the channel
        // lists share no element, so `select_uwb` fails to build.
        let err = select_for_peer(&local, &peer, &base_pref()).unwrap_err();
        assert_eq!(err, RangingError::PeerCapabilitiesMismatch);
    }

    #[test]
    fn invalid_config_rejected_before_touching_capabilities() {
        let local = CapabilityDescriptor::new(vec![]);
        let peer = CapabilityDescriptor::new(vec![]);

        let mut pref = base_pref();
        pref.interval_range_ms = (500, 100);

        let err = select_for_peer(&local, &peer, &pref).unwrap_err();
        assert_eq!(err, RangingError::InvalidConfig);
    }
}
