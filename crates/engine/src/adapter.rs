//! The hardware adapter contract (spec §6.3). Adapters (UWB/CS/RTT/RSSI
//! drivers) are external collaborators: the engine only depends on this
//! trait, never on a concrete driver.

use crate::{measurement::RangingMeasurement, peer::PeerId};
use codec::{ConfigBlock, Technology};
use std::sync::Arc;

/// Why an adapter session closed, delivered on
/// [`AdapterCallback::on_closed`] (spec §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterClosedReason {
    Requested,
    FailedToStart,
    LostConnection,
    SystemPolicy,
    Error,
}

/// Events an adapter delivers back to the session that started it. An
/// adapter may call these from its own thread; the session hands them off
/// to its internal queue before mutating any state (spec §5 "Suspension
/// points").
pub trait AdapterCallback: Send + Sync {
    fn on_started(&self, peer: PeerId);
    fn on_stopped(&self, peer: PeerId);
    fn on_closed(&self, peer: PeerId, reason: AdapterClosedReason);
    fn on_ranging_data(&self, peer: PeerId, measurement: RangingMeasurement);
}

/// A single ranging technology's hardware driver, kept entirely outside
/// this crate's concern except for this contract (spec §6.3). The core
/// guarantees at most one active adapter session per (session, peer,
/// technology) (spec §5).
pub trait RangingAdapter: Send + Sync {
    fn technology(&self) -> Technology;

    /// Begins ranging against `peer` with `config`. `callback` is retained
    /// by the adapter for the lifetime of the adapter session.
    fn start(&self, peer: PeerId, config: ConfigBlock, callback: Arc<dyn AdapterCallback>);

    /// Requests orderly shutdown. The adapter must still deliver exactly
    /// one `on_closed` (spec §3 "Adapter session" lifetime invariant).
    fn stop(&self, peer: PeerId);

    /// Whether this adapter can operate at all in `context` (e.g. hardware
    /// present, permission granted). Spec models this as a static/associated
    /// check; Rust has no class-level dispatch, so it's a method on the
    /// trait object instead, called before `start`.
    fn is_supported(&self) -> bool;
}
