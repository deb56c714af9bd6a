//! Per-peer OOB negotiation (C4), spec §4.4. The initiator side is driven
//! to completion by [`negotiate_initiator`]; the responder side is purely
//! reactive (spec: "purely reactive"), so [`Responder`] just builds each
//! response message on demand as the session feeds it inbound messages.

use crate::{
    capability::CapabilityDescriptor,
    connection::{ConnectionError, OobConnection},
    error::RangingError,
    preference::OobPreference,
    selector::{self, PeerSelection},
};
use bytes::Bytes;
use codec::{CapabilityBlock, ConfigBlock, ConfigStatus, Message, Technology, TechnologySet};
use std::time::Duration;

/// Negotiation-stage deadlines (spec §5 timeout table).
#[derive(Debug, Clone, Copy)]
pub struct NegotiationTimeouts {
    pub capability: Duration,
    pub configuration: Duration,
    pub start: Duration,
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self {
            capability: Duration::from_secs(5),
            configuration: Duration::from_secs(5),
            start: Duration::from_secs(10),
        }
    }
}

/// What negotiation produced for the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfig {
    pub selection: PeerSelection,
}

async fn recv_timed(conn: &OobConnection, dur: Duration) -> Result<Message, RangingError> {
    let bytes = tokio::time::timeout(dur, conn.receive())
        .await
        .map_err(|_| RangingError::OobTimeout)?
        .map_err(|e| match e {
            ConnectionError::PeerLost | ConnectionError::Closed => RangingError::PeerLost,
        })?;

    Message::decode(&bytes).map_err(|_| RangingError::OobMalformed)
}

async fn send_msg(conn: &OobConnection, msg: &Message) -> Result<(), RangingError> {
    conn.send(Bytes::from(msg.encode()))
        .await
        .map_err(|_| RangingError::PeerLost)
}

/// Drives the initiator side of negotiation for one peer to completion:
/// `CAPABILITY_REQUEST`/`RESPONSE`, config selection, `SET_CONFIGURATION`,
/// `START_RANGING`. Each stage is bounded by its own deadline (spec §4.4
/// "`AWAIT_*` states carry deadlines").
pub async fn negotiate_initiator(
    conn: &OobConnection,
    local_capabilities: &CapabilityDescriptor,
    pref: &OobPreference,
    timeouts: &NegotiationTimeouts,
) -> Result<NegotiatedConfig, RangingError> {
    pref.validate()?;

    let mut requested = TechnologySet::empty();
    for tech in Technology::ALL {
        if local_capabilities.supports(tech) && !pref.excluded_technologies.contains(tech) {
            requested.insert(tech);
        }
    }

    send_msg(
        conn,
        &Message::CapabilityRequest { technologies: requested },
    )
    .await?;

    let peer_capabilities = match recv_timed(conn, timeouts.capability).await? {
        Message::CapabilityResponse { capabilities } => CapabilityDescriptor::new(capabilities),
        _ => return Err(RangingError::OobMalformed),
    };

    let selection = selector::select_for_peer(local_capabilities, &peer_capabilities, pref)?;

    send_msg(
        conn,
        &Message::SetConfiguration {
            technologies: TechnologySet::new(&[selection.technology]),
            start_immediately: TechnologySet::empty(),
            configs: vec![selection.config.clone()],
        },
    )
    .await?;

    match recv_timed(conn, timeouts.configuration).await? {
        Message::SetConfigurationResponse { statuses } => {
            let accepted = statuses.iter().any(|(tech, status)| {
                *tech == selection.technology && *status == ConfigStatus::Ok
            });
            if !accepted {
                return Err(RangingError::PeerCapabilitiesMismatch);
            }
        }
        _ => return Err(RangingError::OobMalformed),
    }

    send_msg(
        conn,
        &Message::StartRanging {
            technologies: TechnologySet::new(&[selection.technology]),
        },
    )
    .await?;

    match recv_timed(conn, timeouts.start).await? {
        Message::StartRangingResponse { successful } if successful.contains(selection.technology) => {
            Ok(NegotiatedConfig { selection })
        }
        Message::StartRangingResponse { .. } => Err(RangingError::FailedToStart),
        _ => Err(RangingError::OobMalformed),
    }
}

/// Broadcasts `STOP_RANGING` and waits (bounded) for the acknowledgement.
/// `stop()` is idempotent and best-effort (spec §4.2/§5): a timed-out or
/// malformed reply here is logged by the caller, not treated as fatal.
pub async fn negotiate_stop(
    conn: &OobConnection,
    technologies: TechnologySet,
    timeout: Duration,
) -> Result<(), RangingError> {
    send_msg(conn, &Message::StopRanging { technologies }).await?;
    match recv_timed(conn, timeout).await? {
        Message::StopRangingResponse { .. } => Ok(()),
        _ => Err(RangingError::OobMalformed),
    }
}

/// Builds the responder side's replies. Kept stateless and purely
/// functional: the session (which already serialises events per peer)
/// decides when to call each method as inbound messages arrive.
pub struct Responder<'a> {
    pub local_capabilities: &'a CapabilityDescriptor,
}

impl<'a> Responder<'a> {
    pub fn handle_capability_request(&self, requested: TechnologySet) -> Message {
        let capabilities: Vec<CapabilityBlock> = self
            .local_capabilities
            .blocks()
            .iter()
            .filter(|b| requested.contains(b.technology()))
            .cloned()
            .collect();

        Message::CapabilityResponse { capabilities }
    }

    pub fn handle_set_configuration(
        &self,
        technologies: TechnologySet,
        configs: &[ConfigBlock],
    ) -> Message {
        let statuses = configs
            .iter()
            .map(|block| {
                let tech = block.technology();
                let ok = technologies.contains(tech) && self.local_capabilities.supports(tech);
                (tech, if ok { ConfigStatus::Ok } else { ConfigStatus::Rejected })
            })
            .collect();

        Message::SetConfigurationResponse { statuses }
    }

    pub fn handle_start_ranging(&self, successful: TechnologySet) -> Message {
        Message::StartRangingResponse { successful }
    }

    pub fn handle_stop_ranging(&self, technologies: TechnologySet) -> Message {
        Message::StopRangingResponse { technologies }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::UwbCapability;

    fn uwb() -> CapabilityBlock {
        CapabilityBlock::Uwb(UwbCapability {
            channels: vec![9],
            preambles: vec![11],
            config_ids: vec![1],
            slot_duration_mask: 0b11,
            min_interval_ms: 100,
            max_interval_ms: 5000,
            device_address: [1, 2],
        })
    }

    #[test]
    fn responder_only_advertises_requested_technologies() {
        let local = CapabilityDescriptor::new(vec![uwb()]);
        let responder = Responder { local_capabilities: &local };

        let response = responder.handle_capability_request(TechnologySet::empty());
        match response {
            Message::CapabilityResponse { capabilities } => assert!(capabilities.is_empty()),
            _ => panic!("expected CapabilityResponse"),
        }
    }

    #[test]
    fn responder_rejects_configuration_for_unsupported_technology() {
        let local = CapabilityDescriptor::new(vec![]);
        let responder = Responder { local_capabilities: &local };

        let configs = vec![ConfigBlock::Uwb(codec::UwbConfig {
            channel: 9,
            preamble: 11,
            config_id: codec::UwbConfigId::UnicastDsTwr,
            slot_duration_ms: 1,
            update_rate: codec::UpdateRate::Normal,
            device_address: [1, 2],
            session_id: 7,
        })];

        let response = responder.handle_set_configuration(TechnologySet::new(&[Technology::Uwb]), &configs);
        match response {
            Message::SetConfigurationResponse { statuses } => {
                assert_eq!(statuses, vec![(Technology::Uwb, ConfigStatus::Rejected)]);
            }
            _ => panic!("expected SetConfigurationResponse"),
        }
    }
}
