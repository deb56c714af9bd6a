//! The OOB transport contract (spec §6.2): a caller-supplied duplex byte
//! channel per peer. The core assumes whole-message delivery; framing is
//! the transport's responsibility.

use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Events a transport delivers to the [`OobConnection`](crate::connection::OobConnection)
/// that owns it.
pub trait TransportCallback: Send + Sync {
    fn on_receive(&self, bytes: Bytes);
    fn on_disconnect(&self);
    fn on_reconnect(&self);
    fn on_close(&self);
}

/// One peer's OOB transport, supplied by the caller (a BLE GATT
/// characteristic, a secure socket, ...).
pub trait TransportHandle: Send + Sync {
    /// Best-effort single-shot transmit; resolves once the transport has
    /// attempted the send.
    fn send(&self, bytes: Bytes) -> BoxFuture<'static, bool>;

    /// Registers the callback the transport uses to deliver inbound
    /// events. Called exactly once, when the connection is created.
    fn register_receive_callback(&self, cb: Arc<dyn TransportCallback>);
}
