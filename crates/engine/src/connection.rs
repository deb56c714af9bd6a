//! OOB Connection Manager (C5): a per-peer reliable-duplex message channel
//! over a caller-supplied [`TransportHandle`], with disconnect/reconnect/
//! close semantics and bounded (single-slot) receive buffering (spec
//! §4.5).

use crate::transport::{TransportCallback, TransportHandle};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    Closed,
    PeerLost,
}

struct Inner {
    state: ConnectionState,
    pending_sends: VecDeque<(Bytes, oneshot::Sender<Result<(), ConnectionError>>)>,
    latest_received: Option<Bytes>,
    receive_waiters: VecDeque<oneshot::Sender<Result<Bytes, ConnectionError>>>,
    disconnect_task: Option<JoinHandle<()>>,
}

/// One (session, peer) OOB connection. Always constructed behind an `Arc`
/// since the disconnect timer and the transport's receive callback both
/// need to call back into it after construction.
pub struct OobConnection {
    transport: Arc<dyn TransportHandle>,
    disconnect_timeout: Duration,
    self_weak: Mutex<Weak<OobConnection>>,
    inner: Mutex<Inner>,
}

impl OobConnection {
    /// Default disconnect-before-CLOSED deadline (spec §5 timeout table).
    pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(transport: Arc<dyn TransportHandle>, disconnect_timeout: Duration) -> Arc<Self> {
        let this = Arc::new(Self {
            transport,
            disconnect_timeout,
            self_weak: Mutex::new(Weak::new()),
            inner: Mutex::new(Inner {
                state: ConnectionState::Connected,
                pending_sends: VecDeque::new(),
                latest_received: None,
                receive_waiters: VecDeque::new(),
                disconnect_task: None,
            }),
        });

        *this.self_weak.lock() = Arc::downgrade(&this);
        this.transport
            .register_receive_callback(this.clone() as Arc<dyn TransportCallback>);
        this
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Resolves once the transport acknowledges transmission. Queued (in
    /// arrival order) while DISCONNECTED; resolves with `Closed`
    /// immediately if CLOSED.
    pub async fn send(&self, bytes: Bytes) -> Result<(), ConnectionError> {
        let connected_now = match self.inner.lock().state {
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            ConnectionState::Connected => true,
            ConnectionState::Disconnected => false,
        };

        if connected_now {
            if self.transport.send(bytes.clone()).await {
                return Ok(());
            }
            log::warn!("oob transport rejected send, queueing for retry on reconnect");
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return Err(ConnectionError::Closed);
            }
            inner.pending_sends.push_back((bytes, tx));
        }
        rx.await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Resolves with the next inbound message. If one arrived before this
    /// call, resolves immediately with the single buffered payload (only
    /// the latest is retained — spec §4.5 "Receive buffer").
    pub async fn receive(&self) -> Result<Bytes, ConnectionError> {
        let immediate = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                _ => inner.latest_received.take(),
            }
        };

        if let Some(bytes) = immediate {
            return Ok(bytes);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return Err(ConnectionError::Closed);
            }
            inner.receive_waiters.push_back(tx);
        }
        rx.await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Transitions to CLOSED. Pending sends and receives resolve with
    /// `Closed`; further operations return `Closed` synchronously.
    pub fn close(&self) {
        let (pending, waiters) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closed;
            if let Some(task) = inner.disconnect_task.take() {
                task.abort();
            }
            (
                std::mem::take(&mut inner.pending_sends),
                std::mem::take(&mut inner.receive_waiters),
            )
        };

        for (_, tx) in pending {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
        for tx in waiters {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
    }

    /// Called once the disconnect deadline fires with no reconnect.
    fn force_close_on_timeout(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Disconnected {
                return;
            }
            inner.state = ConnectionState::Closed;
            inner.disconnect_task = None;
            std::mem::take(&mut inner.pending_sends)
        };

        log::warn!("oob connection disconnect timeout expired, forcing closed");
        for (_, tx) in pending {
            let _ = tx.send(Err(ConnectionError::PeerLost));
        }
    }

    fn flush_pending_sends(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut inner = this.inner.lock();
                    if inner.state != ConnectionState::Connected {
                        return;
                    }
                    inner.pending_sends.pop_front()
                };

                let Some((bytes, tx)) = next else { return };
                let ok = this.transport.send(bytes).await;
                let _ = tx.send(if ok { Ok(()) } else { Err(ConnectionError::Closed) });
            }
        });
    }
}

impl TransportCallback for OobConnection {
    fn on_receive(&self, bytes: Bytes) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }
        if let Some(tx) = inner.receive_waiters.pop_front() {
            let _ = tx.send(Ok(bytes));
        } else {
            inner.latest_received = Some(bytes);
        }
    }

    fn on_disconnect(&self) {
        let weak = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            self.self_weak.lock().clone()
        };

        log::warn!(
            "oob connection disconnected, arming {:?} deadline",
            self.disconnect_timeout
        );

        let timeout = self.disconnect_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn) = weak.upgrade() {
                conn.force_close_on_timeout();
            }
        });

        self.inner.lock().disconnect_task = Some(task);
    }

    fn on_reconnect(&self) {
        let weak = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Disconnected {
                return;
            }
            inner.state = ConnectionState::Connected;
            if let Some(task) = inner.disconnect_task.take() {
                task.abort();
            }
            self.self_weak.lock().clone()
        };

        if let Some(conn) = weak.upgrade() {
            conn.flush_pending_sends();
        }
    }

    fn on_close(&self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::Ordering;

    struct FakeTransport {
        sent: Mutex<Vec<Bytes>>,
        should_succeed: std::sync::atomic::AtomicBool,
        cb: Mutex<Option<Arc<dyn TransportCallback>>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                should_succeed: std::sync::atomic::AtomicBool::new(true),
                cb: Mutex::new(None),
            })
        }
    }

    impl TransportHandle for FakeTransport {
        fn send(&self, bytes: Bytes) -> BoxFuture<'static, bool> {
            let ok = self.should_succeed.load(Ordering::SeqCst);
            self.sent.lock().push(bytes);
            Box::pin(async move { ok })
        }

        fn register_receive_callback(&self, cb: Arc<dyn TransportCallback>) {
            *self.cb.lock() = Some(cb);
        }
    }

    #[tokio::test]
    async fn send_resolves_ok_when_connected() {
        let transport = FakeTransport::new();
        let conn = OobConnection::new(transport.clone(), Duration::from_secs(1));
        assert!(conn.send(Bytes::from_static(b"hi")).await.is_ok());
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn receive_returns_buffered_latest_message() {
        let transport = FakeTransport::new();
        let conn = OobConnection::new(transport.clone(), Duration::from_secs(1));
        let cb = transport.cb.lock().clone().unwrap();
        cb.on_receive(Bytes::from_static(b"first"));
        cb.on_receive(Bytes::from_static(b"second"));

        let got = conn.receive().await.unwrap();
        assert_eq!(got, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn close_resolves_pending_receive_with_closed() {
        let transport = FakeTransport::new();
        let conn = OobConnection::new(transport, Duration::from_secs(1));

        let conn2 = conn.clone();
        let handle = tokio::spawn(async move { conn2.receive().await });
        tokio::task::yield_now().await;
        conn.close();

        let result = handle.await.unwrap();
        assert_eq!(result, Err(ConnectionError::Closed));
    }

    #[tokio::test]
    async fn disconnect_then_timeout_drops_pending_sends_with_peer_lost() {
        let transport = FakeTransport::new();
        let conn = OobConnection::new(transport.clone(), Duration::from_millis(10));
        let cb = transport.cb.lock().clone().unwrap();

        cb.on_disconnect();
        let conn2 = conn.clone();
        let send_task = tokio::spawn(async move { conn2.send(Bytes::from_static(b"queued")).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = send_task.await.unwrap();
        assert_eq!(result, Err(ConnectionError::PeerLost));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnect_before_timeout_flushes_queued_sends() {
        let transport = FakeTransport::new();
        let conn = OobConnection::new(transport.clone(), Duration::from_millis(200));
        let cb = transport.cb.lock().clone().unwrap();

        cb.on_disconnect();
        let conn2 = conn.clone();
        let send_task = tokio::spawn(async move { conn2.send(Bytes::from_static(b"queued")).await });
        tokio::task::yield_now().await;

        cb.on_reconnect();
        let result = send_task.await.unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
