//! The caller (application) surface (spec §6.1) and the executor
//! abstraction callbacks are delivered on.

use crate::{error::ClosedReason, measurement::RangingMeasurement, peer::PeerId};
use codec::Technology;
use futures::future::BoxFuture;

/// Callbacks a [`Session`](crate::session::Session) delivers to its caller.
/// Never invoked while the session's internal lock is held (spec §5, §8).
pub trait SessionCallback: Send + Sync {
    fn on_started(&self, peer: PeerId, technology: Technology);
    fn on_start_failed(&self, peer: PeerId, reason: crate::error::RangingError);
    fn on_data(&self, peer: PeerId, measurement: RangingMeasurement);
    fn on_ranging_stopped(&self, peer: PeerId);
    fn on_closed(&self, reason: ClosedReason);
}

/// The caller-supplied executor callbacks are dispatched on (spec §6.1:
/// "Callbacks are delivered on the executor the caller supplied").
/// Generalizes a bare `tokio::spawn` at the call site into a trait so a
/// caller can supply its own executor instead of always getting tokio's.
pub trait CallbackExecutor: Send + Sync {
    fn spawn(&self, fut: BoxFuture<'static, ()>);
}

/// The default executor: hands the future to the ambient tokio runtime.
pub struct TokioExecutor;

impl CallbackExecutor for TokioExecutor {
    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        tokio::spawn(fut);
    }
}
