//! Peer identity. A [`PeerId`] is a stable 128-bit opaque handle used as a
//! map key throughout the core; it carries no radio address of its own
//! (a small `Copy` struct used the same way as a session/connection map
//! key).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u128);

impl PeerId {
    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    /// A fresh opaque id, useful for OOB-discovered peers and demo/test
    /// code that doesn't derive the id from a radio address.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
