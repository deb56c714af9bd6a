//! End-to-end session lifecycle scenarios (spec §8 "End-to-end scenarios"),
//! driven through the public `SessionManager`/`SessionHandle` surface with
//! an in-process loopback transport and a synthetic adapter — no real
//! hardware or socket involved.

use ahash::AHashMap;
use bytes::Bytes;
use codec::{CapabilityBlock, ConfigBlock, RssiCapability, Technology, UwbCapability};
use engine::{
    AdapterCallback, AdapterClosedReason, CallbackExecutor, CapabilityDescriptor, ClosedReason,
    Confidence, DataNotificationPolicy, DeviceRole, OobPreference, PeerId, PeerStartKind,
    RangingAdapter, RangingError, RangingMeasurement, SessionCallback, SessionDeps,
    SessionManager, StartPreference, StaticCapabilityProvider, TokioExecutor, TransportCallback,
    TransportHandle,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;

// ---- loopback transport --------------------------------------------------

struct LoopbackInner {
    peer: Mutex<Option<Arc<Loopback>>>,
    callback: Mutex<Option<Arc<dyn TransportCallback>>>,
    dropped: AtomicBool,
}

struct Loopback(LoopbackInner);

impl Loopback {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self(LoopbackInner {
            peer: Mutex::new(None),
            callback: Mutex::new(None),
            dropped: AtomicBool::new(false),
        }));
        let b = Arc::new(Self(LoopbackInner {
            peer: Mutex::new(None),
            callback: Mutex::new(None),
            dropped: AtomicBool::new(false),
        }));
        *a.0.peer.lock() = Some(b.clone());
        *b.0.peer.lock() = Some(a.clone());
        (a, b)
    }

    /// Simulates the transport losing the link without closing it.
    fn drop_link(&self) {
        self.0.dropped.store(true, Ordering::SeqCst);
        if let Some(cb) = self.0.callback.lock().clone() {
            cb.on_disconnect();
        }
    }

    fn restore_link(&self) {
        self.0.dropped.store(false, Ordering::SeqCst);
        if let Some(cb) = self.0.callback.lock().clone() {
            cb.on_reconnect();
        }
    }
}

impl TransportHandle for Loopback {
    fn send(&self, bytes: Bytes) -> BoxFuture<'static, bool> {
        if self.0.dropped.load(Ordering::SeqCst) {
            return Box::pin(async { false });
        }
        let peer = self.0.peer.lock().clone();
        Box::pin(async move {
            let Some(peer) = peer else { return false };
            let cb = peer.0.callback.lock().clone();
            let Some(cb) = cb else { return false };
            cb.on_receive(bytes);
            true
        })
    }

    fn register_receive_callback(&self, cb: Arc<dyn TransportCallback>) {
        *self.0.callback.lock() = Some(cb);
    }
}

// ---- synthetic adapter ----------------------------------------------------

/// Starts instantly, emits `measurement_count` measurements a few
/// milliseconds apart, then idles until `stop`.
struct InstantAdapter {
    technology: Technology,
    measurement_count: u32,
    cancel: Mutex<AHashMap<PeerId, oneshot::Sender<()>>>,
}

impl InstantAdapter {
    fn new(technology: Technology, measurement_count: u32) -> Arc<Self> {
        Arc::new(Self { technology, measurement_count, cancel: Mutex::new(AHashMap::new()) })
    }
}

impl RangingAdapter for InstantAdapter {
    fn technology(&self) -> Technology {
        self.technology
    }

    fn start(&self, peer: PeerId, _config: ConfigBlock, callback: Arc<dyn AdapterCallback>) {
        let (tx, mut rx) = oneshot::channel();
        self.cancel.lock().insert(peer, tx);

        let technology = self.technology;
        let count = self.measurement_count;

        tokio::spawn(async move {
            callback.on_started(peer);

            let mut ts = 0u64;
            for _ in 0..count {
                tokio::select! {
                    _ = &mut rx => {
                        callback.on_stopped(peer);
                        callback.on_closed(peer, AdapterClosedReason::Requested);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        ts += 1_000_000;
                        callback.on_ranging_data(peer, RangingMeasurement {
                            technology,
                            peer,
                            distance_m: 1.23,
                            azimuth_deg: None,
                            elevation_deg: None,
                            rssi: Some(-50),
                            timestamp_ns: ts,
                            confidence: Confidence::High,
                        });
                    }
                }
            }

            // Idle until stop() is called explicitly.
            let _ = rx.await;
            callback.on_stopped(peer);
            callback.on_closed(peer, AdapterClosedReason::Requested);
        });
    }

    fn stop(&self, peer: PeerId) {
        if let Some(tx) = self.cancel.lock().remove(&peer) {
            let _ = tx.send(());
        }
    }

    fn is_supported(&self) -> bool {
        true
    }
}

// ---- recording callback ---------------------------------------------------

#[derive(Debug, Clone)]
enum Event {
    Started(PeerId, Technology),
    StartFailed(PeerId, RangingError),
    Data(PeerId),
    Stopped(PeerId),
    Closed(ClosedReason),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl SessionCallback for Recorder {
    fn on_started(&self, peer: PeerId, technology: Technology) {
        self.events.lock().push(Event::Started(peer, technology));
    }

    fn on_start_failed(&self, peer: PeerId, reason: RangingError) {
        self.events.lock().push(Event::StartFailed(peer, reason));
    }

    fn on_data(&self, peer: PeerId, _measurement: RangingMeasurement) {
        self.events.lock().push(Event::Data(peer));
    }

    fn on_ranging_stopped(&self, peer: PeerId) {
        self.events.lock().push(Event::Stopped(peer));
    }

    fn on_closed(&self, reason: ClosedReason) {
        self.events.lock().push(Event::Closed(reason));
    }
}

struct ImmediateExecutor;

impl CallbackExecutor for ImmediateExecutor {
    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        tokio::spawn(fut);
    }
}

fn uwb_capability(addr: [u8; 2]) -> CapabilityBlock {
    CapabilityBlock::Uwb(UwbCapability {
        channels: vec![9],
        preambles: vec![11],
        config_ids: vec![1],
        slot_duration_mask: 0b11,
        min_interval_ms: 100,
        max_interval_ms: 5000,
        device_address: addr,
    })
}

fn rssi_only_capability() -> CapabilityDescriptor {
    CapabilityDescriptor::new(vec![CapabilityBlock::Rssi(RssiCapability {
        bluetooth_address: [9, 9, 9, 9, 9, 9],
    })])
}

async fn wait_until_closed(events: &Arc<Recorder>) {
    for _ in 0..200 {
        if matches!(events.events().last(), Some(Event::Closed(_))) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn adapters_for(technology: Technology, count: u32) -> AHashMap<Technology, Arc<dyn RangingAdapter>> {
    let mut map: AHashMap<Technology, Arc<dyn RangingAdapter>> = AHashMap::new();
    map.insert(technology, InstantAdapter::new(technology, count));
    map
}

#[tokio::test]
async fn happy_path_single_uwb_peer() {
    let manager = SessionManager::new(16);
    let (initiator_t, responder_t) = Loopback::pair();

    let initiator_events = Arc::new(Recorder::default());
    let responder_events = Arc::new(Recorder::default());

    let initiator = manager
        .create_session(SessionDeps {
            attribution: "a".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![
                uwb_capability([1, 1]),
            ]))),
            adapters: adapters_for(Technology::Uwb, 3),
            callback: initiator_events.clone(),
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    let responder = manager
        .create_session(SessionDeps {
            attribution: "b".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![
                uwb_capability([2, 2]),
            ]))),
            adapters: adapters_for(Technology::Uwb, 3),
            callback: responder_events.clone(),
            executor: Arc::new(ImmediateExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    let peer = PeerId::from_u128(1);

    initiator.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(initiator_t));
    responder.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(responder_t));

    let mut responder_peers = AHashMap::new();
    responder_peers.insert(peer, PeerStartKind::Oob(OobPreference::default()));
    responder
        .start(StartPreference {
            role: DeviceRole::Responder,
            measurement_limit: 0,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: responder_peers,
        })
        .unwrap();

    let mut initiator_peers = AHashMap::new();
    initiator_peers.insert(peer, PeerStartKind::Oob(OobPreference::default()));
    initiator
        .start(StartPreference {
            role: DeviceRole::Initiator,
            measurement_limit: 0,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: initiator_peers,
        })
        .unwrap();

    // Wait for the initiator to observe on_started.
    for _ in 0..200 {
        if initiator_events.events().iter().any(|e| matches!(e, Event::Started(..))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(initiator_events
        .events()
        .iter()
        .any(|e| matches!(e, Event::Started(p, Technology::Uwb) if *p == peer)));

    initiator.stop();
    wait_until_closed(&initiator_events).await;

    let events = initiator_events.events();
    let started_idx = events.iter().position(|e| matches!(e, Event::Started(..))).unwrap();
    let stopped_idx = events.iter().position(|e| matches!(e, Event::Stopped(..))).unwrap();
    let closed_idx = events.iter().position(|e| matches!(e, Event::Closed(..))).unwrap();

    assert!(started_idx < stopped_idx, "onStarted must precede onStopped");
    assert!(stopped_idx < closed_idx, "onStopped must precede onClosed");
    assert_eq!(events.iter().filter(|e| matches!(e, Event::Closed(_))).count(), 1);
    assert!(matches!(events[closed_idx], Event::Closed(ClosedReason::Requested)));
}

#[tokio::test]
async fn peer_with_no_shared_technology_gets_start_failed_while_session_continues() {
    let manager = SessionManager::new(16);
    let (initiator_t, responder_t) = Loopback::pair();

    let initiator_events = Arc::new(Recorder::default());
    let responder_events = Arc::new(Recorder::default());

    let initiator = manager
        .create_session(SessionDeps {
            attribution: "a".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![
                uwb_capability([1, 1]),
            ]))),
            adapters: adapters_for(Technology::Uwb, 1),
            callback: initiator_events.clone(),
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    // Responder advertises only RSSI, but the initiator's OOB preference
    // below excludes RSSI: no common technology survives.
    let responder = manager
        .create_session(SessionDeps {
            attribution: "b".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(rssi_only_capability())),
            adapters: AHashMap::new(),
            callback: responder_events,
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    let peer = PeerId::from_u128(42);
    initiator.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(initiator_t));
    responder.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(responder_t));

    let mut responder_peers = AHashMap::new();
    responder_peers.insert(peer, PeerStartKind::Oob(OobPreference::default()));
    responder
        .start(StartPreference {
            role: DeviceRole::Responder,
            measurement_limit: 0,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: responder_peers,
        })
        .unwrap();

    let mut pref = OobPreference::default();
    pref.excluded_technologies.insert(Technology::Rssi);

    let mut initiator_peers = AHashMap::new();
    initiator_peers.insert(peer, PeerStartKind::Oob(pref));
    initiator
        .start(StartPreference {
            role: DeviceRole::Initiator,
            measurement_limit: 0,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: initiator_peers,
        })
        .unwrap();

    for _ in 0..200 {
        if initiator_events.events().iter().any(|e| matches!(e, Event::StartFailed(..))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(initiator_events
        .events()
        .iter()
        .any(|e| matches!(e, Event::StartFailed(p, RangingError::PeerCapabilitiesMismatch) if *p == peer)));

    // The session itself must still be alive (not torn down by one peer's
    // failure) and respond to an explicit stop.
    initiator.stop();
    wait_until_closed(&initiator_events).await;
    assert!(matches!(initiator_events.events().last(), Some(Event::Closed(ClosedReason::Requested))));
}

#[tokio::test]
async fn measurement_limit_stops_session_after_n_rounds() {
    let manager = SessionManager::new(16);
    let (initiator_t, responder_t) = Loopback::pair();

    let initiator_events = Arc::new(Recorder::default());
    let responder_events = Arc::new(Recorder::default());

    let initiator = manager
        .create_session(SessionDeps {
            attribution: "a".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![
                uwb_capability([1, 1]),
            ]))),
            adapters: adapters_for(Technology::Uwb, 5),
            callback: initiator_events.clone(),
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    let responder = manager
        .create_session(SessionDeps {
            attribution: "b".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![
                uwb_capability([2, 2]),
            ]))),
            adapters: adapters_for(Technology::Uwb, 5),
            callback: responder_events,
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    let peer = PeerId::from_u128(7);
    initiator.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(initiator_t));
    responder.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(responder_t));

    let mut responder_peers = AHashMap::new();
    responder_peers.insert(peer, PeerStartKind::Oob(OobPreference::default()));
    responder
        .start(StartPreference {
            role: DeviceRole::Responder,
            measurement_limit: 0,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: responder_peers,
        })
        .unwrap();

    let mut initiator_peers = AHashMap::new();
    initiator_peers.insert(peer, PeerStartKind::Oob(OobPreference::default()));
    initiator
        .start(StartPreference {
            role: DeviceRole::Initiator,
            measurement_limit: 3,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: initiator_peers,
        })
        .unwrap();

    wait_until_closed(&initiator_events).await;

    let events = initiator_events.events();
    let data_count = events.iter().filter(|e| matches!(e, Event::Data(_))).count();
    assert_eq!(data_count, 3, "exactly the round limit's worth of onData must be forwarded");
    assert!(matches!(events.last(), Some(Event::Closed(ClosedReason::LimitReached))));
}

#[tokio::test]
async fn oob_disconnect_within_timeout_does_not_fail_negotiation() {
    let manager = SessionManager::new(16);
    let (initiator_t, responder_t) = Loopback::pair();

    let initiator_events = Arc::new(Recorder::default());
    let responder_events = Arc::new(Recorder::default());

    let initiator = manager
        .create_session(SessionDeps {
            attribution: "a".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![
                uwb_capability([1, 1]),
            ]))),
            adapters: adapters_for(Technology::Uwb, 2),
            callback: initiator_events.clone(),
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    let responder = manager
        .create_session(SessionDeps {
            attribution: "b".into(),
            capability_provider: Arc::new(StaticCapabilityProvider::new(CapabilityDescriptor::new(vec![
                uwb_capability([2, 2]),
            ]))),
            adapters: adapters_for(Technology::Uwb, 2),
            callback: responder_events,
            executor: Arc::new(TokioExecutor),
            fusion: None,
            timeouts: Default::default(),
        })
        .unwrap();

    let peer = PeerId::from_u128(3);
    initiator.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(initiator_t.clone()));
    responder.add_peer(peer, PeerStartKind::Oob(OobPreference::default()), Some(responder_t));

    // Disrupt the link immediately, before negotiation starts, and restore
    // it a moment later — well inside the default 30s disconnect timeout.
    initiator_t.drop_link();
    tokio::spawn({
        let t = initiator_t.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            t.restore_link();
        }
    });

    let mut responder_peers = AHashMap::new();
    responder_peers.insert(peer, PeerStartKind::Oob(OobPreference::default()));
    responder
        .start(StartPreference {
            role: DeviceRole::Responder,
            measurement_limit: 0,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: responder_peers,
        })
        .unwrap();

    let mut initiator_peers = AHashMap::new();
    initiator_peers.insert(peer, PeerStartKind::Oob(OobPreference::default()));
    initiator
        .start(StartPreference {
            role: DeviceRole::Initiator,
            measurement_limit: 0,
            notification_policy: DataNotificationPolicy::Enabled,
            sensor_fusion: false,
            aoa_requested: false,
            peers: initiator_peers,
        })
        .unwrap();

    for _ in 0..300 {
        if initiator_events.events().iter().any(|e| matches!(e, Event::Started(..))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(
        initiator_events.events().iter().any(|e| matches!(e, Event::Started(..))),
        "negotiation should complete once the link is restored within the disconnect timeout"
    );

    initiator.stop();
    wait_until_closed(&initiator_events).await;
}
