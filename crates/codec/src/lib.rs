//! Out-of-band ranging negotiation wire format.
//!
//! The OOB transport (BLE GATT characteristic, secure socket, ...) delivers
//! whole messages; framing is the transport's responsibility. Every message
//! this crate understands starts with a two byte header:
//!
//! ```text
//! byte 0: protocol version (currently 1)
//! byte 1: message type
//! ```
//!
//! Per-technology payloads inside `CAPABILITY_RESPONSE` / `SET_CONFIGURATION`
//! are packed as a technology header (technology id, block length including
//! the header) followed by a technology-specific body. Sets of technologies
//! advertised in a single message are packed as a little-endian two byte
//! bitmap, bit `i` corresponding to technology id `i`.

pub mod message;
pub mod technology;

pub use message::{ConfigStatus, Message, MessageType};
pub use technology::{
    CapabilityBlock, ConfigBlock, CsCapability, CsConfig, RssiCapability, RssiConfig,
    RttCapability, RttConfig, SecurityLevel, Technology, TechnologySet, UpdateRate,
    UwbCapability, UwbConfig, UwbConfigId,
};

use std::fmt;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Buffer is shorter than a message header requires.
    Truncated,
    /// The version byte is zero.
    ZeroVersion,
    /// A technology block declares a length longer than the remaining bytes.
    BlockOverrun,
    /// A technology-specific body failed to parse (wrong length, bad enum
    /// discriminant, non-UTF8 string, ...).
    MalformedBody,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "message shorter than its declared header"),
            Self::ZeroVersion => write!(f, "protocol version is zero"),
            Self::BlockOverrun => write!(f, "technology block length exceeds available bytes"),
            Self::MalformedBody => write!(f, "technology-specific body failed to parse"),
        }
    }
}

/// CRC32 fingerprint, used the same way STUN uses it: a cheap tamper check
/// appended after the message integrity tag.
///
/// # Test
///
/// ```
/// use codec::fingerprint;
///
/// assert_eq!(fingerprint(b"ranging"), fingerprint(b"ranging"));
/// assert_ne!(fingerprint(b"ranging"), fingerprint(b"fusion"));
/// ```
pub fn fingerprint(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes) ^ 0x5a4e_5247
}
