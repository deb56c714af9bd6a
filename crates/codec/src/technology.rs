//! Technology identifiers and the per-technology capability / configuration
//! payloads carried inside OOB messages.

use crate::Error;

/// The closed set of ranging technologies the core drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Technology {
    Uwb = 0,
    Cs = 1,
    Rtt = 2,
    Rssi = 3,
}

impl Technology {
    pub const ALL: [Technology; 4] = [
        Technology::Uwb,
        Technology::Cs,
        Technology::Rtt,
        Technology::Rssi,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Uwb,
            1 => Self::Cs,
            2 => Self::Rtt,
            3 => Self::Rssi,
            _ => return None,
        })
    }
}

/// A little-endian two byte bitmap over [`Technology`] ids.
///
/// # Test
///
/// ```
/// use codec::{Technology, TechnologySet};
///
/// let set = TechnologySet::new(&[Technology::Uwb, Technology::Rtt]);
/// assert!(set.contains(Technology::Uwb));
/// assert!(set.contains(Technology::Rtt));
/// assert!(!set.contains(Technology::Cs));
///
/// let bytes = set.to_le_bytes();
/// assert_eq!(TechnologySet::from_le_bytes(bytes), set);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TechnologySet(u16);

impl TechnologySet {
    pub fn new(techs: &[Technology]) -> Self {
        let mut bits = 0u16;
        for t in techs {
            bits |= 1 << t.id();
        }
        Self(bits)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, tech: Technology) -> bool {
        self.0 & (1 << tech.id()) != 0
    }

    pub fn insert(&mut self, tech: Technology) {
        self.0 |= 1 << tech.id();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Technology> + '_ {
        Technology::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_le_bytes(bytes))
    }
}

/// Ranging update rate, shared across technologies. Each technology maps
/// these to its own nominal interval (see `crates/engine::selector`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UpdateRate {
    Infrequent = 0,
    Normal = 1,
    Fast = 2,
    Frequent = 3,
}

impl UpdateRate {
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Self::Infrequent,
            1 => Self::Normal,
            2 => Self::Fast,
            3 => Self::Frequent,
            _ => return Err(Error::MalformedBody),
        })
    }
}

/// Bluetooth CS security tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SecurityLevel {
    Basic = 0,
    Secure = 1,
}

impl SecurityLevel {
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Self::Basic,
            1 => Self::Secure,
            _ => return Err(Error::MalformedBody),
        })
    }
}

/// UWB ranging config id, the closed set this core negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UwbConfigId {
    UnicastDsTwr = 1,
    MulticastDsTwr = 2,
    UnicastDsTwrNoAoa = 3,
}

impl UwbConfigId {
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            1 => Self::UnicastDsTwr,
            2 => Self::MulticastDsTwr,
            3 => Self::UnicastDsTwrNoAoa,
            _ => return Err(Error::MalformedBody),
        })
    }
}

fn write_u8_list(out: &mut Vec<u8>, items: &[u8]) {
    out.push(items.len() as u8);
    out.extend_from_slice(items);
}

fn read_u8_list(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>, Error> {
    let count = *buf.get(*cursor).ok_or(Error::MalformedBody)? as usize;
    *cursor += 1;
    let end = cursor.checked_add(count).ok_or(Error::MalformedBody)?;
    let slice = buf.get(*cursor..end).ok_or(Error::MalformedBody)?;
    *cursor = end;
    Ok(slice.to_vec())
}

/// Capability descriptor advertised by one side for UWB.
///
/// Equality is structural, as required by spec: identical inputs to the
/// selector produce identical outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UwbCapability {
    pub channels: Vec<u8>,
    pub preambles: Vec<u8>,
    pub config_ids: Vec<u8>,
    /// Bit 0 = 1ms slots supported, bit 1 = 2ms slots supported.
    pub slot_duration_mask: u8,
    pub min_interval_ms: u16,
    pub max_interval_ms: u16,
    pub device_address: [u8; 2],
}

impl UwbCapability {
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_u8_list(out, &self.channels);
        write_u8_list(out, &self.preambles);
        write_u8_list(out, &self.config_ids);
        out.push(self.slot_duration_mask);
        out.extend_from_slice(&self.min_interval_ms.to_be_bytes());
        out.extend_from_slice(&self.max_interval_ms.to_be_bytes());
        out.extend_from_slice(&self.device_address);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut cursor = 0;
        let channels = read_u8_list(buf, &mut cursor)?;
        let preambles = read_u8_list(buf, &mut cursor)?;
        let config_ids = read_u8_list(buf, &mut cursor)?;
        let slot_duration_mask = *buf.get(cursor).ok_or(Error::MalformedBody)?;
        cursor += 1;
        let min_interval_ms = u16::from_be_bytes(
            buf.get(cursor..cursor + 2)
                .ok_or(Error::MalformedBody)?
                .try_into()
                .unwrap(),
        );
        cursor += 2;
        let max_interval_ms = u16::from_be_bytes(
            buf.get(cursor..cursor + 2)
                .ok_or(Error::MalformedBody)?
                .try_into()
                .unwrap(),
        );
        cursor += 2;
        let device_address: [u8; 2] = buf
            .get(cursor..cursor + 2)
            .ok_or(Error::MalformedBody)?
            .try_into()
            .unwrap();

        Ok(Self {
            channels,
            preambles,
            config_ids,
            slot_duration_mask,
            min_interval_ms,
            max_interval_ms,
            device_address,
        })
    }
}

/// Selected UWB parameters for one peer, sent in `SET_CONFIGURATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UwbConfig {
    pub channel: u8,
    pub preamble: u8,
    pub config_id: UwbConfigId,
    /// Milliseconds; constrained to {1, 2} (spec §8).
    pub slot_duration_ms: u8,
    pub update_rate: UpdateRate,
    pub device_address: [u8; 2],
    pub session_id: u32,
}

impl UwbConfig {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.push(self.preamble);
        out.push(self.config_id as u8);
        out.push(self.slot_duration_ms);
        out.push(self.update_rate as u8);
        out.extend_from_slice(&self.device_address);
        out.extend_from_slice(&self.session_id.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 11 {
            return Err(Error::MalformedBody);
        }

        let slot_duration_ms = buf[3];
        if slot_duration_ms != 1 && slot_duration_ms != 2 {
            return Err(Error::MalformedBody);
        }

        Ok(Self {
            channel: buf[0],
            preamble: buf[1],
            config_id: UwbConfigId::from_u8(buf[2])?,
            slot_duration_ms,
            update_rate: UpdateRate::from_u8(buf[4])?,
            device_address: [buf[5], buf[6]],
            session_id: u32::from_be_bytes(buf[7..11].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsCapability {
    /// Bit 0 = BASIC, bit 1 = SECURE.
    pub security_level_mask: u8,
    pub update_rate_mask: u8,
    /// Opaque pass-through values; the core never interprets these.
    pub location_type: u8,
    pub sight_type: u8,
}

impl CsCapability {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.security_level_mask);
        out.push(self.update_rate_mask);
        out.push(self.location_type);
        out.push(self.sight_type);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::MalformedBody);
        }

        Ok(Self {
            security_level_mask: buf[0],
            update_rate_mask: buf[1],
            location_type: buf[2],
            sight_type: buf[3],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsConfig {
    pub security_level: SecurityLevel,
    pub update_rate: UpdateRate,
    pub location_type: u8,
    pub sight_type: u8,
}

impl CsConfig {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.security_level as u8);
        out.push(self.update_rate as u8);
        out.push(self.location_type);
        out.push(self.sight_type);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::MalformedBody);
        }

        Ok(Self {
            security_level: SecurityLevel::from_u8(buf[0])?,
            update_rate: UpdateRate::from_u8(buf[1])?,
            location_type: buf[2],
            sight_type: buf[3],
        })
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, Error> {
    let len = *buf.get(*cursor).ok_or(Error::MalformedBody)? as usize;
    *cursor += 1;
    let end = cursor.checked_add(len).ok_or(Error::MalformedBody)?;
    let slice = buf.get(*cursor..end).ok_or(Error::MalformedBody)?;
    *cursor = end;
    std::str::from_utf8(slice)
        .map(str::to_string)
        .map_err(|_| Error::MalformedBody)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttCapability {
    pub service_name: String,
    pub match_filter: Vec<u8>,
    pub max_bandwidth_mhz: u8,
    pub rx_chains: u8,
}

impl RttCapability {
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.service_name);
        write_u8_list(out, &self.match_filter);
        out.push(self.max_bandwidth_mhz);
        out.push(self.rx_chains);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut cursor = 0;
        let service_name = read_string(buf, &mut cursor)?;
        let match_filter = read_u8_list(buf, &mut cursor)?;
        let max_bandwidth_mhz = *buf.get(cursor).ok_or(Error::MalformedBody)?;
        cursor += 1;
        let rx_chains = *buf.get(cursor).ok_or(Error::MalformedBody)?;

        Ok(Self {
            service_name,
            match_filter,
            max_bandwidth_mhz,
            rx_chains,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttConfig {
    pub service_name: String,
    pub match_filter: Vec<u8>,
    pub bandwidth_mhz: u8,
    pub rx_chains: u8,
}

impl RttConfig {
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.service_name);
        write_u8_list(out, &self.match_filter);
        out.push(self.bandwidth_mhz);
        out.push(self.rx_chains);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut cursor = 0;
        let service_name = read_string(buf, &mut cursor)?;
        let match_filter = read_u8_list(buf, &mut cursor)?;
        let bandwidth_mhz = *buf.get(cursor).ok_or(Error::MalformedBody)?;
        cursor += 1;
        let rx_chains = *buf.get(cursor).ok_or(Error::MalformedBody)?;

        Ok(Self {
            service_name,
            match_filter,
            bandwidth_mhz,
            rx_chains,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiCapability {
    pub bluetooth_address: [u8; 6],
}

impl RssiCapability {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bluetooth_address);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 6 {
            return Err(Error::MalformedBody);
        }

        Ok(Self {
            bluetooth_address: buf[0..6].try_into().unwrap(),
        })
    }
}

pub type RssiConfig = RssiCapability;

/// A single technology's capability block, tagged by [`Technology`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityBlock {
    Uwb(UwbCapability),
    Cs(CsCapability),
    Rtt(RttCapability),
    Rssi(RssiCapability),
}

impl CapabilityBlock {
    pub fn technology(&self) -> Technology {
        match self {
            Self::Uwb(_) => Technology::Uwb,
            Self::Cs(_) => Technology::Cs,
            Self::Rtt(_) => Technology::Rtt,
            Self::Rssi(_) => Technology::Rssi,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Self::Uwb(c) => c.encode(out),
            Self::Cs(c) => c.encode(out),
            Self::Rtt(c) => c.encode(out),
            Self::Rssi(c) => c.encode(out),
        }
    }

    fn decode_body(tech: Technology, body: &[u8]) -> Result<Self, Error> {
        Ok(match tech {
            Technology::Uwb => Self::Uwb(UwbCapability::decode(body)?),
            Technology::Cs => Self::Cs(CsCapability::decode(body)?),
            Technology::Rtt => Self::Rtt(RttCapability::decode(body)?),
            Technology::Rssi => Self::Rssi(RssiCapability::decode(body)?),
        })
    }
}

/// A single technology's chosen configuration, tagged by [`Technology`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigBlock {
    Uwb(UwbConfig),
    Cs(CsConfig),
    Rtt(RttConfig),
    Rssi(RssiConfig),
}

impl ConfigBlock {
    pub fn technology(&self) -> Technology {
        match self {
            Self::Uwb(_) => Technology::Uwb,
            Self::Cs(_) => Technology::Cs,
            Self::Rtt(_) => Technology::Rtt,
            Self::Rssi(_) => Technology::Rssi,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Self::Uwb(c) => c.encode(out),
            Self::Cs(c) => c.encode(out),
            Self::Rtt(c) => c.encode(out),
            Self::Rssi(c) => c.encode(out),
        }
    }

    fn decode_body(tech: Technology, body: &[u8]) -> Result<Self, Error> {
        Ok(match tech {
            Technology::Uwb => Self::Uwb(UwbConfig::decode(body)?),
            Technology::Cs => Self::Cs(CsConfig::decode(body)?),
            Technology::Rtt => Self::Rtt(RttConfig::decode(body)?),
            Technology::Rssi => Self::Rssi(RssiConfig::decode(body)?),
        })
    }
}

/// Writes `[tech id][len incl. header][body]`, returning nothing: `out` is
/// extended in place.
pub(crate) fn write_tech_block(out: &mut Vec<u8>, tech: Technology, body: &[u8]) {
    out.push(tech.id());
    // +2 for the technology header itself.
    out.push((body.len() + 2) as u8);
    out.extend_from_slice(body);
}

pub(crate) fn encode_capability_block(out: &mut Vec<u8>, block: &CapabilityBlock) {
    let mut body = Vec::with_capacity(16);
    block.encode_body(&mut body);
    write_tech_block(out, block.technology(), &body);
}

pub(crate) fn encode_config_block(out: &mut Vec<u8>, block: &ConfigBlock) {
    let mut body = Vec::with_capacity(16);
    block.encode_body(&mut body);
    write_tech_block(out, block.technology(), &body);
}

/// Parses a concatenation of technology blocks until `buf` is exhausted.
/// Blocks for unknown technology ids are skipped using the advertised
/// length rather than rejected, per spec §4.4.
pub(crate) fn decode_blocks<T>(
    buf: &[u8],
    mut decode_one: impl FnMut(Technology, &[u8]) -> Result<T, Error>,
) -> Result<Vec<T>, Error> {
    let mut out = Vec::new();
    let mut cursor = 0;

    while cursor < buf.len() {
        let header = buf.get(cursor..cursor + 2).ok_or(Error::BlockOverrun)?;
        let tech_id = header[0];
        let block_len = header[1] as usize;

        if block_len < 2 {
            return Err(Error::MalformedBody);
        }

        let end = cursor.checked_add(block_len).ok_or(Error::BlockOverrun)?;
        let body = buf.get(cursor + 2..end).ok_or(Error::BlockOverrun)?;

        if let Some(tech) = Technology::from_id(tech_id) {
            out.push(decode_one(tech, body)?);
        }
        // Unknown technology ids are silently skipped.

        cursor = end;
    }

    Ok(out)
}

pub(crate) fn decode_capability_blocks(buf: &[u8]) -> Result<Vec<CapabilityBlock>, Error> {
    decode_blocks(buf, CapabilityBlock::decode_body)
}

pub(crate) fn decode_config_blocks(buf: &[u8]) -> Result<Vec<ConfigBlock>, Error> {
    decode_blocks(buf, ConfigBlock::decode_body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uwb_config(slot_duration_ms: u8) -> UwbConfig {
        UwbConfig {
            channel: 9,
            preamble: 11,
            config_id: UwbConfigId::UnicastDsTwr,
            slot_duration_ms,
            update_rate: UpdateRate::Normal,
            device_address: [1, 2],
            session_id: 42,
        }
    }

    #[test]
    fn uwb_config_round_trips_for_valid_slot_durations() {
        for ms in [1u8, 2] {
            let cfg = uwb_config(ms);
            let mut buf = Vec::new();
            cfg.encode(&mut buf);
            assert_eq!(UwbConfig::decode(&buf).unwrap(), cfg);
        }
    }

    #[test]
    fn uwb_config_rejects_slot_duration_outside_one_or_two_ms() {
        // spec: "Slot duration constrained to {1, 2} ms; any other value
        // rejected."
        let cfg = uwb_config(3);
        let mut buf = Vec::new();
        cfg.encode(&mut buf);
        assert_eq!(UwbConfig::decode(&buf), Err(Error::MalformedBody));
    }

    #[test]
    fn technology_set_round_trips_arbitrary_subsets() {
        let set = TechnologySet::new(&[Technology::Cs, Technology::Rssi]);
        assert!(!set.contains(Technology::Uwb));
        assert!(set.contains(Technology::Cs));
        assert!(set.contains(Technology::Rssi));
        assert_eq!(TechnologySet::from_le_bytes(set.to_le_bytes()), set);
    }
}
