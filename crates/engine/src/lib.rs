//! Session engine: manager, session state machine, config selector, OOB
//! connection manager and negotiation FSM (spec §1 components C1-C5).
//!
//! This crate depends on `codec` for the wire format and on nothing else
//! from this workspace; hardware adapters, capability providers, fusion
//! filters and transports are trait objects supplied by whoever embeds the
//! engine (the root `ranging-core` binary, or any other caller).

pub mod adapter;
pub mod callback;
pub mod capability;
pub mod connection;
pub mod error;
pub mod fusion;
pub mod manager;
pub mod measurement;
pub mod negotiation;
pub mod peer;
pub mod preference;
pub mod selector;
pub mod session;
pub mod transport;

pub use adapter::{AdapterCallback, AdapterClosedReason, RangingAdapter};
pub use callback::{CallbackExecutor, SessionCallback, TokioExecutor};
pub use capability::{CapabilityDescriptor, CapabilityProvider, StaticCapabilityProvider};
pub use connection::{ConnectionError, ConnectionState, OobConnection};
pub use error::{ClosedReason, RangingError};
pub use fusion::FusionFilter;
pub use manager::{ManagerError, SessionManager};
pub use measurement::{Confidence, RangingMeasurement};
pub use peer::PeerId;
pub use preference::{DataNotificationPolicy, DeviceRole, OobPreference, PeerStartKind, StartPreference};
pub use session::{SessionDeps, SessionHandle, SessionId, SessionState, SessionTimeouts};
pub use transport::{TransportCallback, TransportHandle};
