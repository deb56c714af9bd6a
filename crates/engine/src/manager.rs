//! Session Manager (C1): the single process-wide entry point for session
//! creation and for routing session-id-addressed events (spec §4.1).
//!
//! Concretely this is the one piece of process-wide mutable state the core
//! carries: a monotonically increasing id counter and a registry of live
//! sessions, both behind one `parking_lot::RwLock` (spec §5 "No
//! process-wide mutable state other than the Session Manager registry and
//! a monotonically increasing session id counter").

use crate::{
    capability::CapabilityProvider,
    peer::PeerId,
    preference::{PeerStartKind, StartPreference},
    session::{self, SessionDeps, SessionHandle, SessionId, SessionRegistry, SessionState},
    transport::TransportHandle,
};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A caller-command routed by session id rather than through a
/// [`SessionHandle`] directly — the shape an outward IPC surface that only
/// carries numeric ids (and not Rust handles) would dispatch (spec §4.1
/// `dispatch(session_id, event)`).
pub enum ManagerEvent {
    Start(StartPreference),
    Stop,
    Close,
    AddPeer {
        peer: PeerId,
        kind: PeerStartKind,
        transport: Option<Arc<dyn TransportHandle>>,
    },
    RemovePeer(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerError {
    /// The per-process session cap (spec §4.1 `create_session`) was hit.
    ResourceExhausted,
}

impl std::error::Error for ManagerError {}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "per-process session cap reached"),
        }
    }
}

struct Registry {
    sessions: AHashMap<SessionId, SessionHandle>,
}

/// Owns the set of live sessions and the process-wide session id counter.
/// One instance per process; callers hold it behind an `Arc`.
pub struct SessionManager {
    next_id: AtomicU64,
    max_sessions: usize,
    registry: RwLock<Registry>,
}

impl SessionManager {
    /// `max_sessions` bounds the live-session count; exceeding it fails
    /// `create_session` with [`ManagerError::ResourceExhausted`] rather than
    /// growing unboundedly.
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            max_sessions,
            registry: RwLock::new(Registry { sessions: AHashMap::new() }),
        })
    }

    /// Number of sessions currently reachable from this manager (spec §4.1
    /// invariant (b): reachable iff not TERMINATED).
    pub fn live_count(&self) -> usize {
        self.registry.read().sessions.len()
    }

    /// Allocates a fresh monotonically-increasing session id, spawns the
    /// session actor in state INIT, registers it, and returns a handle.
    pub fn create_session(
        self: &Arc<Self>,
        deps: SessionDeps,
    ) -> Result<SessionHandle, ManagerError> {
        {
            let registry = self.registry.read();
            if registry.sessions.len() >= self.max_sessions {
                return Err(ManagerError::ResourceExhausted);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = session::spawn_session(id, deps, Some(self.clone() as Arc<dyn SessionRegistry>));

        self.registry.write().sessions.insert(id, handle.clone());
        Ok(handle)
    }

    /// Looks up `session_id`; if absent, logs and drops (spec §4.1
    /// invariant (c): "no event is delivered after a session reports
    /// TERMINATED"), otherwise forwards `event` onto that session's
    /// internal queue in arrival order.
    pub fn dispatch(&self, session_id: SessionId, event: ManagerEvent) {
        let handle = self.registry.read().sessions.get(&session_id).cloned();

        let Some(handle) = handle else {
            log::warn!("session manager: dispatch for unknown session {}", session_id);
            return;
        };

        match event {
            ManagerEvent::Start(pref) => {
                if let Err(e) = handle.start(pref) {
                    log::warn!("session {}: start rejected: {}", session_id, e);
                }
            }
            ManagerEvent::Stop => handle.stop(),
            ManagerEvent::Close => handle.close(),
            ManagerEvent::AddPeer { peer, kind, transport } => handle.add_peer(peer, kind, transport),
            ManagerEvent::RemovePeer(peer) => handle.remove_peer(peer),
        }
    }

    /// Returns a handle for an already-created session, or `None` if it is
    /// unknown or has already terminated and been reaped.
    pub fn get(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.registry.read().sessions.get(&session_id).cloned()
    }

    /// Iterates live sessions in ascending id order and initiates ordered
    /// teardown of each (spec §4.1 `close_all`). `reason` is logged only:
    /// the session's own `onClosed(REQUESTED)` is what the caller observes.
    pub fn close_all(&self, reason: &str) {
        let mut ids: Vec<SessionId> = self.registry.read().sessions.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let handle = self.registry.read().sessions.get(&id).cloned();
            if let Some(handle) = handle {
                log::info!("session manager: closing session {} ({})", id, reason);
                handle.close();
            }
        }
    }
}

impl SessionRegistry for SessionManager {
    fn remove(&self, id: SessionId) {
        self.registry.write().sessions.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        callback::{SessionCallback, TokioExecutor},
        capability::{CapabilityDescriptor, StaticCapabilityProvider},
        error::{ClosedReason, RangingError},
        measurement::RangingMeasurement,
        session::SessionTimeouts,
    };
    use codec::Technology;

    struct NoopCallback;

    impl SessionCallback for NoopCallback {
        fn on_started(&self, _peer: PeerId, _technology: Technology) {}
        fn on_start_failed(&self, _peer: PeerId, _reason: RangingError) {}
        fn on_data(&self, _peer: PeerId, _measurement: RangingMeasurement) {}
        fn on_ranging_stopped(&self, _peer: PeerId) {}
        fn on_closed(&self, _reason: ClosedReason) {}
    }

    fn deps() -> SessionDeps {
        SessionDeps {
            attribution: "test".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![]))),
            adapters: AHashMap::new(),
            callback: Arc::new(NoopCallback),
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: SessionTimeouts::default(),
        }
    }

    #[tokio::test]
    async fn session_ids_are_unique_and_monotonic() {
        let manager = SessionManager::new(10);
        let a = manager.create_session(deps()).unwrap();
        let b = manager.create_session(deps()).unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn create_session_fails_past_cap() {
        let manager = SessionManager::new(1);
        manager.create_session(deps()).unwrap();
        assert_eq!(manager.create_session(deps()).unwrap_err(), ManagerError::ResourceExhausted);
    }

    #[tokio::test]
    async fn dispatch_to_unknown_session_is_dropped_not_panicked() {
        let manager = SessionManager::new(10);
        manager.dispatch(9999, ManagerEvent::Stop);
    }

    #[tokio::test]
    async fn terminated_session_is_unreachable_from_manager() {
        let manager = SessionManager::new(10);
        let handle = manager.create_session(deps()).unwrap();
        assert_eq!(manager.live_count(), 1);

        handle.close();
        // Let the actor drain the Close message and call back into the
        // registry via SessionRegistry::remove.
        for _ in 0..50 {
            if manager.live_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.live_count(), 0);
        assert!(manager.get(handle.id).is_none());
    }
}
