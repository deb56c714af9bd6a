//! The failure taxonomy of spec §7. Every kind here is either surfaced to
//! the caller (via a callback) or logged and contained, never panicked on.

use std::fmt;

/// A failure kind, independent of where it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingError {
    /// Caller's preference fails validation (e.g. near > far, limit > 65535).
    InvalidConfig,
    /// Local device advertises none of the caller's accepted technologies.
    Unsupported,
    /// A specific peer shares no technology with the caller's accepted set.
    PeerCapabilitiesMismatch,
    /// Caller's ranging-interval range intersects no supported technology.
    IncompatibleInterval,
    /// An OOB negotiation stage exceeded its deadline.
    OobTimeout,
    /// A received OOB message failed to parse or violated the FSM.
    OobMalformed,
    /// The OOB connection closed, or its disconnect timer expired.
    PeerLost,
    /// The adapter rejected `start`.
    FailedToStart,
    /// The adapter reported link loss mid-ranging.
    LostConnection,
    /// The session's measurement-round limit was reached.
    LimitReached,
    /// The caller invoked `stop`/`close`.
    Cancelled,
    /// An internal invariant was violated; the offending component is torn
    /// down and the rest of the system proceeds.
    InternalError,
}

impl RangingError {
    /// Whether this error, raised against one peer, should end that peer's
    /// negotiation FSM or adapter lifecycle without affecting the rest of
    /// the session (spec §7 "Policy").
    pub fn is_peer_scoped(self) -> bool {
        !matches!(
            self,
            Self::InvalidConfig | Self::Unsupported | Self::LimitReached | Self::Cancelled
        )
    }
}

impl std::error::Error for RangingError {}

impl fmt::Display for RangingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidConfig => "caller preference failed validation",
            Self::Unsupported => "local device supports none of the accepted technologies",
            Self::PeerCapabilitiesMismatch => "peer shares no technology with the caller",
            Self::IncompatibleInterval => "requested interval range matches no technology",
            Self::OobTimeout => "OOB negotiation stage timed out",
            Self::OobMalformed => "OOB message failed to parse",
            Self::PeerLost => "OOB connection lost",
            Self::FailedToStart => "adapter rejected start",
            Self::LostConnection => "adapter reported link loss",
            Self::LimitReached => "measurement round limit reached",
            Self::Cancelled => "caller cancelled the session",
            Self::InternalError => "internal invariant violated",
        };
        write!(f, "{}", msg)
    }
}

/// Why a session transitioned to `TERMINATED`, surfaced on `onClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    Requested,
    LimitReached,
    Error,
}

impl From<RangingError> for ClosedReason {
    fn from(e: RangingError) -> Self {
        match e {
            RangingError::Cancelled => Self::Requested,
            RangingError::LimitReached => Self::LimitReached,
            _ => Self::Error,
        }
    }
}
