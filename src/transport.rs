//! An in-process, loopback OOB transport: two `LoopbackTransport` handles
//! wired to each other's callback, so the demo binary can exercise the full
//! negotiation FSM without a real BLE/socket transport underneath it.

use bytes::Bytes;
use engine::{TransportCallback, TransportHandle};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct Inner {
    peer: Weak<LoopbackTransport>,
    callback: Option<Arc<dyn TransportCallback>>,
}

/// One end of an in-process duplex pair. `send` hands bytes directly to the
/// other end's registered callback on a spawned task, so this still models
/// the transport contract's asynchronous, best-effort `send`.
pub struct LoopbackTransport {
    inner: Mutex<Inner>,
}

impl LoopbackTransport {
    /// Builds a connected pair: `a`'s sends arrive on `b`'s callback and
    /// vice versa.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self { inner: Mutex::new(Inner { peer: Weak::new(), callback: None }) });
        let b = Arc::new(Self { inner: Mutex::new(Inner { peer: Weak::new(), callback: None }) });

        a.inner.lock().peer = Arc::downgrade(&b);
        b.inner.lock().peer = Arc::downgrade(&a);

        (a, b)
    }
}

impl TransportHandle for LoopbackTransport {
    fn send(&self, bytes: Bytes) -> BoxFuture<'static, bool> {
        let peer = self.inner.lock().peer.clone();
        Box::pin(async move {
            let Some(peer) = peer.upgrade() else { return false };
            let callback = peer.inner.lock().callback.clone();
            let Some(callback) = callback else { return false };
            callback.on_receive(bytes);
            true
        })
    }

    fn register_receive_callback(&self, cb: Arc<dyn TransportCallback>) {
        self.inner.lock().callback = Some(cb);
    }
}
