//! Ties `ranging-core-engine` to a runnable process: configuration
//! loading, a fixed local `CapabilityProvider`, synthetic adapters for
//! local exercising, and `core_main`, which a binary or an integration
//! test can call directly.

pub mod adapters;
pub mod capability;
pub mod config;
pub mod transport;

use ahash::AHashMap;
use capability::DemoCapabilityProvider;
use codec::Technology;
use config::Config;
use engine::{
    ClosedReason, PeerId, PeerStartKind, RangingAdapter, RangingError, RangingMeasurement,
    SessionCallback, SessionDeps, SessionManager, StartPreference, TokioExecutor,
};
use std::{sync::Arc, time::Duration};
use transport::LoopbackTransport;

/// Logs every callback it receives, tagged with the session it belongs to.
/// Stands in for the outward IPC surface (spec §1: out of scope, "named
/// where relevant").
struct LoggingCallback {
    label: &'static str,
}

impl SessionCallback for LoggingCallback {
    fn on_started(&self, peer: PeerId, technology: Technology) {
        log::info!("[{}] peer {} started on {:?}", self.label, peer, technology);
    }

    fn on_start_failed(&self, peer: PeerId, reason: RangingError) {
        log::warn!("[{}] peer {} failed to start: {}", self.label, peer, reason);
    }

    fn on_data(&self, peer: PeerId, measurement: RangingMeasurement) {
        log::info!(
            "[{}] peer {} distance={:.2}m confidence={:?}",
            self.label,
            peer,
            measurement.distance_m,
            measurement.confidence
        );
    }

    fn on_ranging_stopped(&self, peer: PeerId) {
        log::info!("[{}] peer {} ranging stopped", self.label, peer);
    }

    fn on_closed(&self, reason: ClosedReason) {
        log::info!("[{}] session closed: {:?}", self.label, reason);
    }
}

fn demo_adapters() -> AHashMap<Technology, Arc<dyn RangingAdapter>> {
    let mut adapters: AHashMap<Technology, Arc<dyn RangingAdapter>> = AHashMap::new();
    adapters.insert(Technology::Uwb, adapters::LoopbackAdapter::new(Technology::Uwb, Duration::from_millis(200)));
    adapters.insert(Technology::Cs, adapters::LoopbackAdapter::new(Technology::Cs, Duration::from_millis(200)));
    adapters.insert(Technology::Rtt, adapters::LoopbackAdapter::new(Technology::Rtt, Duration::from_millis(200)));
    adapters.insert(Technology::Rssi, adapters::LoopbackAdapter::new(Technology::Rssi, Duration::from_millis(200)));
    adapters
}

/// Runs one end-to-end demo: two in-process "devices" (an initiator and a
/// responder) connected by a loopback OOB transport, negotiating and
/// ranging for a handful of rounds before the initiator stops the session.
///
/// Exposed as a plain function, not buried in `main`, so an integration
/// test can drive it directly.
pub async fn core_main(config: Arc<Config>) -> anyhow::Result<()> {
    let timeouts = config.timeouts.to_engine();

    let initiator_manager = SessionManager::new(config.limits.max_sessions);
    let responder_manager = SessionManager::new(config.limits.max_sessions);

    let (initiator_transport, responder_transport) = LoopbackTransport::pair();

    let initiator = initiator_manager.create_session(SessionDeps {
        attribution: "demo-initiator".into(),
        capability_provider: Arc::new(DemoCapabilityProvider::new([0x01, 0x01], [1, 2, 3, 4, 5, 6])),
        adapters: demo_adapters(),
        callback: Arc::new(LoggingCallback { label: "initiator" }),
        executor: Arc::new(TokioExecutor),
        fusion: None,
        timeouts: timeouts.clone(),
    })?;

    let responder = responder_manager.create_session(SessionDeps {
        attribution: "demo-responder".into(),
        capability_provider: Arc::new(DemoCapabilityProvider::new([0x02, 0x02], [6, 5, 4, 3, 2, 1])),
        adapters: demo_adapters(),
        callback: Arc::new(LoggingCallback { label: "responder" }),
        executor: Arc::new(TokioExecutor),
        fusion: None,
        timeouts,
    })?;

    let peer = PeerId::random();
    initiator.add_peer(peer, PeerStartKind::Oob(Default::default()), Some(initiator_transport));
    responder.add_peer(peer, PeerStartKind::Oob(Default::default()), Some(responder_transport));

    let mut responder_peers = AHashMap::new();
    responder_peers.insert(peer, PeerStartKind::Oob(Default::default()));
    responder.start(StartPreference {
        role: engine::DeviceRole::Responder,
        measurement_limit: 0,
        notification_policy: engine::DataNotificationPolicy::Enabled,
        sensor_fusion: false,
        aoa_requested: false,
        peers: responder_peers,
    })?;

    let mut initiator_peers = AHashMap::new();
    initiator_peers.insert(peer, PeerStartKind::Oob(Default::default()));
    initiator.start(StartPreference {
        role: engine::DeviceRole::Initiator,
        measurement_limit: 5,
        notification_policy: engine::DataNotificationPolicy::Enabled,
        sensor_fusion: false,
        aoa_requested: false,
        peers: initiator_peers,
    })?;

    tokio::time::sleep(Duration::from_secs(5)).await;

    responder.close();
    initiator_manager.close_all("demo complete");
    responder_manager.close_all("demo complete");

    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
