//! Negotiation message framing: header, message types, and the payload shape
//! for each type in the table of spec §4.4.

use crate::{
    technology::{
        decode_capability_blocks, decode_config_blocks, encode_capability_block,
        encode_config_block, CapabilityBlock, ConfigBlock,
    },
    Error, Technology, TechnologySet, PROTOCOL_VERSION,
};

/// The closed set of OOB message types. `Unknown` is the forward-compatible
/// catch-all: a parser that sees a type byte it doesn't recognise yields
/// `Unknown` rather than failing outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    CapabilityRequest = 0,
    CapabilityResponse = 1,
    SetConfiguration = 2,
    SetConfigurationResponse = 3,
    StartRanging = 4,
    StartRangingResponse = 5,
    StopRanging = 6,
    StopRangingResponse = 7,
    Unknown = 8,
}

impl MessageType {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::CapabilityRequest,
            1 => Self::CapabilityResponse,
            2 => Self::SetConfiguration,
            3 => Self::SetConfigurationResponse,
            4 => Self::StartRanging,
            5 => Self::StartRangingResponse,
            6 => Self::StopRanging,
            7 => Self::StopRangingResponse,
            _ => Self::Unknown,
        }
    }
}

/// Per-technology accept/reject outcome carried in `SET_CONFIGURATION_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    Ok,
    Rejected,
}

impl ConfigStatus {
    fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Rejected => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::Rejected,
            _ => return Err(Error::MalformedBody),
        })
    }
}

/// A fully decoded (or, for `Unknown`, partially-understood) OOB message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CapabilityRequest {
        technologies: TechnologySet,
    },
    CapabilityResponse {
        capabilities: Vec<CapabilityBlock>,
    },
    SetConfiguration {
        technologies: TechnologySet,
        start_immediately: TechnologySet,
        configs: Vec<ConfigBlock>,
    },
    SetConfigurationResponse {
        statuses: Vec<(Technology, ConfigStatus)>,
    },
    StartRanging {
        technologies: TechnologySet,
    },
    StartRangingResponse {
        successful: TechnologySet,
    },
    StopRanging {
        technologies: TechnologySet,
    },
    StopRangingResponse {
        technologies: TechnologySet,
    },
    /// An unrecognised message type, kept for forward compatibility. The raw
    /// payload (everything after the two header bytes) is preserved so a
    /// relay can forward it even without understanding it.
    Unknown {
        raw_type: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::CapabilityRequest { .. } => MessageType::CapabilityRequest,
            Self::CapabilityResponse { .. } => MessageType::CapabilityResponse,
            Self::SetConfiguration { .. } => MessageType::SetConfiguration,
            Self::SetConfigurationResponse { .. } => MessageType::SetConfigurationResponse,
            Self::StartRanging { .. } => MessageType::StartRanging,
            Self::StartRangingResponse { .. } => MessageType::StartRangingResponse,
            Self::StopRanging { .. } => MessageType::StopRanging,
            Self::StopRangingResponse { .. } => MessageType::StopRangingResponse,
            Self::Unknown { .. } => MessageType::Unknown,
        }
    }

    /// Serialises this message into a fresh buffer, including the two byte
    /// header.
    ///
    /// # Test
    ///
    /// ```
    /// use codec::{Message, Technology, TechnologySet};
    ///
    /// let msg = Message::CapabilityRequest {
    ///     technologies: TechnologySet::new(&[Technology::Uwb, Technology::Cs]),
    /// };
    ///
    /// let bytes = msg.encode();
    /// assert_eq!(bytes[0], 1); // protocol version
    /// assert_eq!(bytes[1], 0); // CAPABILITY_REQUEST
    ///
    /// let decoded = Message::decode(&bytes).unwrap();
    /// assert_eq!(decoded, msg);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.push(PROTOCOL_VERSION);
        out.push(self.message_type() as u8);

        match self {
            Self::CapabilityRequest { technologies } => {
                out.extend_from_slice(&technologies.to_le_bytes());
            }
            Self::CapabilityResponse { capabilities } => {
                for block in capabilities {
                    encode_capability_block(&mut out, block);
                }
            }
            Self::SetConfiguration {
                technologies,
                start_immediately,
                configs,
            } => {
                out.extend_from_slice(&technologies.to_le_bytes());
                out.extend_from_slice(&start_immediately.to_le_bytes());
                for block in configs {
                    encode_config_block(&mut out, block);
                }
            }
            Self::SetConfigurationResponse { statuses } => {
                out.push(statuses.len() as u8);
                for (tech, status) in statuses {
                    out.push(tech.id());
                    out.push(status.to_u8());
                }
            }
            Self::StartRanging { technologies } => {
                // Per spec table: START_RANGING carries a single byte bitmap.
                out.push(technologies.to_le_bytes()[0]);
            }
            Self::StartRangingResponse { successful } => {
                out.extend_from_slice(&successful.to_le_bytes());
            }
            Self::StopRanging { technologies } => {
                out.extend_from_slice(&technologies.to_le_bytes());
            }
            Self::StopRangingResponse { technologies } => {
                out.extend_from_slice(&technologies.to_le_bytes());
            }
            Self::Unknown { payload, .. } => {
                out.extend_from_slice(payload);
            }
        }

        out
    }

    /// Parses a message from the wire.
    ///
    /// Rejects messages whose declared block length exceeds the available
    /// bytes, whose technology id is unknown *for required fields*, or
    /// whose version is zero. An unrecognised message type yields `Unknown`
    /// rather than an error.
    ///
    /// # Test
    ///
    /// ```
    /// use codec::{Message, Error};
    ///
    /// assert_eq!(Message::decode(&[]), Err(Error::Truncated));
    /// assert_eq!(Message::decode(&[0, 0]), Err(Error::ZeroVersion));
    ///
    /// // Unknown message type: still parses, carries the raw type byte.
    /// let msg = Message::decode(&[1, 250, 9, 9]).unwrap();
    /// match msg {
    ///     Message::Unknown { raw_type, payload } => {
    ///         assert_eq!(raw_type, 250);
    ///         assert_eq!(payload, vec![9, 9]);
    ///     }
    ///     _ => panic!("expected Unknown"),
    /// }
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 2 {
            return Err(Error::Truncated);
        }

        let version = bytes[0];
        if version == 0 {
            return Err(Error::ZeroVersion);
        }

        let raw_type = bytes[1];
        let body = &bytes[2..];

        Ok(match MessageType::from_u8(raw_type) {
            MessageType::CapabilityRequest => Self::CapabilityRequest {
                technologies: TechnologySet::from_le_bytes(
                    body.get(0..2).ok_or(Error::Truncated)?.try_into().unwrap(),
                ),
            },
            MessageType::CapabilityResponse => Self::CapabilityResponse {
                capabilities: decode_capability_blocks(body)?,
            },
            MessageType::SetConfiguration => {
                let technologies = TechnologySet::from_le_bytes(
                    body.get(0..2).ok_or(Error::Truncated)?.try_into().unwrap(),
                );
                let start_immediately = TechnologySet::from_le_bytes(
                    body.get(2..4).ok_or(Error::Truncated)?.try_into().unwrap(),
                );
                let configs = decode_config_blocks(&body[4..])?;

                Self::SetConfiguration {
                    technologies,
                    start_immediately,
                    configs,
                }
            }
            MessageType::SetConfigurationResponse => {
                let count = *body.first().ok_or(Error::Truncated)? as usize;
                let mut statuses = Vec::with_capacity(count);
                let pairs = body.get(1..).ok_or(Error::Truncated)?;

                for chunk in pairs.chunks(2).take(count) {
                    if chunk.len() < 2 {
                        return Err(Error::Truncated);
                    }
                    let tech = Technology::from_id(chunk[0]).ok_or(Error::MalformedBody)?;
                    statuses.push((tech, ConfigStatus::from_u8(chunk[1])?));
                }

                Self::SetConfigurationResponse { statuses }
            }
            MessageType::StartRanging => Self::StartRanging {
                technologies: TechnologySet::from_le_bytes([
                    *body.first().ok_or(Error::Truncated)?,
                    0,
                ]),
            },
            MessageType::StartRangingResponse => Self::StartRangingResponse {
                successful: TechnologySet::from_le_bytes(
                    body.get(0..2).ok_or(Error::Truncated)?.try_into().unwrap(),
                ),
            },
            MessageType::StopRanging => Self::StopRanging {
                technologies: TechnologySet::from_le_bytes(
                    body.get(0..2).ok_or(Error::Truncated)?.try_into().unwrap(),
                ),
            },
            MessageType::StopRangingResponse => Self::StopRangingResponse {
                technologies: TechnologySet::from_le_bytes(
                    body.get(0..2).ok_or(Error::Truncated)?.try_into().unwrap(),
                ),
            },
            MessageType::Unknown => Self::Unknown {
                raw_type,
                payload: body.to_vec(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::technology::{CsCapability, RssiCapability, RttCapability, UwbCapability};

    #[test]
    fn round_trips_capability_response_with_all_technologies() {
        let msg = Message::CapabilityResponse {
            capabilities: vec![
                CapabilityBlock::Uwb(UwbCapability {
                    channels: vec![5, 9],
                    preambles: vec![9, 10, 11],
                    config_ids: vec![1, 2],
                    slot_duration_mask: 0b11,
                    min_interval_ms: 100,
                    max_interval_ms: 5000,
                    device_address: [0xab, 0xcd],
                }),
                CapabilityBlock::Cs(CsCapability {
                    security_level_mask: 0b11,
                    update_rate_mask: 0b111,
                    location_type: 2,
                    sight_type: 1,
                }),
                CapabilityBlock::Rtt(RttCapability {
                    service_name: "ranging-rtt".to_string(),
                    match_filter: vec![1, 2, 3, 4],
                    max_bandwidth_mhz: 80,
                    rx_chains: 2,
                }),
                CapabilityBlock::Rssi(RssiCapability {
                    bluetooth_address: [1, 2, 3, 4, 5, 6],
                }),
            ],
        };

        let bytes = msg.encode();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_technology_block_is_skipped_not_rejected() {
        // CAPABILITY_RESPONSE with one legit UWB block, then an unknown
        // technology id 9 with a declared length, then nothing else.
        let mut body = Vec::new();
        let uwb = CapabilityBlock::Uwb(UwbCapability {
            channels: vec![9],
            preambles: vec![10],
            config_ids: vec![1],
            slot_duration_mask: 1,
            min_interval_ms: 200,
            max_interval_ms: 2000,
            device_address: [1, 1],
        });
        encode_capability_block(&mut body, &uwb);

        // Unknown technology id 9, block len 5 (header + 3 byte body).
        body.push(9);
        body.push(5);
        body.extend_from_slice(&[0xde, 0xad, 0xbe]);

        let mut bytes = vec![PROTOCOL_VERSION, MessageType::CapabilityResponse as u8];
        bytes.extend_from_slice(&body);

        let decoded = Message::decode(&bytes).unwrap();
        match decoded {
            Message::CapabilityResponse { capabilities } => {
                assert_eq!(capabilities.len(), 1);
                assert_eq!(capabilities[0], uwb);
            }
            _ => panic!("expected CapabilityResponse"),
        }
    }

    #[test]
    fn rejects_block_overrun() {
        // Declared length (250) far exceeds what's actually present.
        let bytes = [PROTOCOL_VERSION, MessageType::CapabilityResponse as u8, 0, 250];
        assert_eq!(Message::decode(&bytes), Err(Error::BlockOverrun));
    }

    #[test]
    fn start_ranging_uses_single_byte_bitmap() {
        let msg = Message::StartRanging {
            technologies: TechnologySet::new(&[Technology::Uwb, Technology::Rssi]),
        };

        let bytes = msg.encode();
        // header (2) + 1 byte bitmap.
        assert_eq!(bytes.len(), 3);

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn set_configuration_response_round_trips_mixed_statuses() {
        let msg = Message::SetConfigurationResponse {
            statuses: vec![
                (Technology::Uwb, ConfigStatus::Ok),
                (Technology::Cs, ConfigStatus::Rejected),
            ],
        };

        let bytes = msg.encode();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
