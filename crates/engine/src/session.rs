//! Session (C2): drives one caller's ranging request to completion across
//! N peers and M technologies, enforcing the state machine, callback
//! ordering and resource reclamation of spec §4.2.
//!
//! Implemented as a single-task actor: one `tokio` task owns all mutable
//! session state and drains an unbounded `mpsc` queue of commands
//! (`start`/`stop`/`add_peer`/...), adapter events and OOB events in
//! arrival order. A small `Mutex<SessionState>` is kept alongside purely
//! so [`SessionHandle`] can answer `state()` and reject a second `start()`
//! without round-tripping through the actor; the actor itself never calls
//! a caller callback while any lock is held (spec §5/§8) — every callback
//! is handed to [`CallbackExecutor`] instead.

use crate::{
    adapter::{AdapterCallback, AdapterClosedReason, RangingAdapter},
    callback::{CallbackExecutor, SessionCallback},
    capability::CapabilityProvider,
    connection::OobConnection,
    error::{ClosedReason, RangingError},
    fusion::FusionFilter,
    measurement::{RangingMeasurement, TimestampGuard},
    negotiation::{self, NegotiatedConfig, NegotiationTimeouts, Responder},
    peer::PeerId,
    preference::{DataNotificationPolicy, DeviceRole, PeerStartKind, StartPreference},
    transport::TransportHandle,
};
use ahash::AHashMap;
use bytes::Bytes;
use codec::{ConfigBlock, ConfigStatus, Message, Technology, TechnologySet};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

pub type SessionId = u64;

/// The session-level state machine of spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Negotiating,
    Starting,
    Ranging,
    Stopping,
    Terminated,
}

/// Timeouts a real deployment would load from persisted settings (spec §5
/// timeout table; the core "reads them at session start only", §6.4).
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    pub negotiation: NegotiationTimeouts,
    pub oob_disconnect: Duration,
    pub stop_drain: Duration,
    pub adapter_no_data: Duration,
    pub fusion_drift: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            negotiation: NegotiationTimeouts::default(),
            oob_disconnect: OobConnection::DEFAULT_DISCONNECT_TIMEOUT,
            stop_drain: Duration::from_secs(3),
            adapter_no_data: Duration::from_secs(2),
            fusion_drift: Duration::from_secs(5),
        }
    }
}

/// Everything a session needs that this crate doesn't implement itself:
/// adapters, the capability provider, the caller's callback/executor, and
/// an optional fusion filter (spec §1 "external collaborators").
pub struct SessionDeps {
    pub attribution: String,
    pub capability_provider: Arc<dyn CapabilityProvider>,
    pub adapters: AHashMap<Technology, Arc<dyn RangingAdapter>>,
    pub callback: Arc<dyn SessionCallback>,
    pub executor: Arc<dyn CallbackExecutor>,
    pub fusion: Option<Arc<dyn FusionFilter>>,
    pub timeouts: SessionTimeouts,
}

/// Lets a session remove itself from whatever owns it (spec §4.1
/// invariant (b): "a session is reachable from the manager iff its state
/// is not TERMINATED") without this module depending on `manager`.
pub trait SessionRegistry: Send + Sync {
    fn remove(&self, id: SessionId);
}

enum SessionMessage {
    Start(StartPreference),
    Stop,
    Close,
    AddPeer {
        peer: PeerId,
        kind: PeerStartKind,
        transport: Option<Arc<dyn TransportHandle>>,
    },
    RemovePeer(PeerId),
    NegotiationDone {
        peer: PeerId,
        result: Result<NegotiatedConfig, RangingError>,
    },
    OobInbound {
        peer: PeerId,
        message: Message,
    },
    AdapterStarted {
        peer: PeerId,
        technology: Technology,
    },
    AdapterStopped {
        peer: PeerId,
        technology: Technology,
    },
    AdapterClosed {
        peer: PeerId,
        technology: Technology,
        reason: AdapterClosedReason,
    },
    AdapterData {
        peer: PeerId,
        measurement: RangingMeasurement,
    },
    Tick,
    StopDeadline,
}

/// A cheap-to-clone handle to one session. All mutating operations are
/// fire-and-forget sends onto the session's internal queue, per spec
/// §4.1's "dispatch... delivers on the session's internal queue in
/// arrival order" applied to caller commands too.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    state: Arc<Mutex<SessionState>>,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Validates `preference` synchronously so malformed input
    /// (`InvalidConfig`) never has to round-trip through the actor (spec
    /// §7: surfaced directly "on start").
    pub fn start(&self, preference: StartPreference) -> Result<(), RangingError> {
        preference.validate()?;
        if self.state() != SessionState::Init {
            log::warn!("session {}: start() outside INIT ignored", self.id);
            return Ok(());
        }
        let _ = self.tx.send(SessionMessage::Start(preference));
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SessionMessage::Stop);
    }

    pub fn close(&self) {
        let _ = self.tx.send(SessionMessage::Close);
    }

    pub fn add_peer(
        &self,
        peer: PeerId,
        kind: PeerStartKind,
        transport: Option<Arc<dyn TransportHandle>>,
    ) {
        let _ = self.tx.send(SessionMessage::AddPeer { peer, kind, transport });
    }

    pub fn remove_peer(&self, peer: PeerId) {
        let _ = self.tx.send(SessionMessage::RemovePeer(peer));
    }
}

struct PeerEntry {
    id: PeerId,
    technology: Option<Technology>,
    oob: Option<Arc<OobConnection>>,
    negotiation_complete: bool,
    adapter_live: bool,
    started_notified: bool,
    stopped_notified: bool,
    last_data_at: Option<Instant>,
    no_data_warned: bool,
    last_fusion_output_at: Option<Instant>,
    fusion_reverted: bool,
    pending_responder_config: Option<(Technology, ConfigBlock)>,
    responder_loop_spawned: bool,
    pending_removal: bool,
}

impl PeerEntry {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            technology: None,
            oob: None,
            negotiation_complete: false,
            adapter_live: false,
            started_notified: false,
            stopped_notified: false,
            last_data_at: None,
            no_data_warned: false,
            last_fusion_output_at: None,
            fusion_reverted: false,
            pending_responder_config: None,
            responder_loop_spawned: false,
            pending_removal: false,
        }
    }
}

struct SessionAdapterCallback {
    tx: mpsc::UnboundedSender<SessionMessage>,
    technology: Technology,
}

impl AdapterCallback for SessionAdapterCallback {
    fn on_started(&self, peer: PeerId) {
        let _ = self
            .tx
            .send(SessionMessage::AdapterStarted { peer, technology: self.technology });
    }

    fn on_stopped(&self, peer: PeerId) {
        let _ = self
            .tx
            .send(SessionMessage::AdapterStopped { peer, technology: self.technology });
    }

    fn on_closed(&self, peer: PeerId, reason: AdapterClosedReason) {
        let _ = self.tx.send(SessionMessage::AdapterClosed {
            peer,
            technology: self.technology,
            reason,
        });
    }

    fn on_ranging_data(&self, peer: PeerId, measurement: RangingMeasurement) {
        let _ = self.tx.send(SessionMessage::AdapterData { peer, measurement });
    }
}

struct SessionActor {
    id: SessionId,
    deps: SessionDeps,
    state: Arc<Mutex<SessionState>>,
    tx: mpsc::UnboundedSender<SessionMessage>,
    role: DeviceRole,
    measurement_limit: u32,
    notification_policy: DataNotificationPolicy,
    sensor_fusion: bool,
    peers: AHashMap<PeerId, PeerEntry>,
    round_peers: HashSet<PeerId>,
    round_count: u32,
    timestamps: TimestampGuard,
    pending_close_reason: Option<ClosedReason>,
    registry: Option<Arc<dyn SessionRegistry>>,
}

/// Spawns the actor task and its periodic round-timer, returning the
/// public handle.
pub fn spawn_session(
    id: SessionId,
    deps: SessionDeps,
    registry: Option<Arc<dyn SessionRegistry>>,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(SessionState::Init));

    let handle = SessionHandle { id, state: state.clone(), tx: tx.clone() };

    let actor = SessionActor {
        id,
        deps,
        state: state.clone(),
        tx: tx.clone(),
        role: DeviceRole::Initiator,
        measurement_limit: 0,
        notification_policy: DataNotificationPolicy::Enabled,
        sensor_fusion: false,
        peers: AHashMap::new(),
        round_peers: HashSet::new(),
        round_count: 0,
        timestamps: TimestampGuard::new(),
        pending_close_reason: None,
        registry,
    };

    tokio::spawn(actor.run(rx));
    spawn_ticker(tx, state);
    handle
}

fn spawn_ticker(tx: mpsc::UnboundedSender<SessionMessage>, state: Arc<Mutex<SessionState>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            interval.tick().await;
            if *state.lock() == SessionState::Terminated {
                return;
            }
            if tx.send(SessionMessage::Tick).is_err() {
                return;
            }
        }
    });
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
            if *self.state.lock() == SessionState::Terminated {
                break;
            }
        }
    }

    fn handle(&mut self, msg: SessionMessage) {
        match msg {
            SessionMessage::Start(pref) => self.on_start(pref),
            SessionMessage::Stop => self.begin_stop(ClosedReason::Requested),
            SessionMessage::Close => self.begin_stop(ClosedReason::Requested),
            SessionMessage::AddPeer { peer, kind, transport } => {
                self.on_add_peer(peer, kind, transport)
            }
            SessionMessage::RemovePeer(peer) => self.on_remove_peer(peer),
            SessionMessage::NegotiationDone { peer, result } => {
                self.on_negotiation_done(peer, result)
            }
            SessionMessage::OobInbound { peer, message } => self.on_oob_inbound(peer, message),
            SessionMessage::AdapterStarted { peer, technology } => {
                self.on_adapter_started(peer, technology)
            }
            SessionMessage::AdapterStopped { peer, .. } => {
                log::debug!("session {}: peer {} adapter stopped (ack)", self.id, peer);
            }
            SessionMessage::AdapterClosed { peer, technology, reason } => {
                self.on_adapter_closed(peer, technology, reason)
            }
            SessionMessage::AdapterData { peer, measurement } => {
                self.on_adapter_data(peer, measurement)
            }
            SessionMessage::Tick => self.on_tick(),
            SessionMessage::StopDeadline => self.on_stop_deadline(),
        }
    }

    fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        self.deps.executor.spawn(Box::pin(async move { f() }));
    }

    fn dispatch_start_failed(&self, peer: PeerId, reason: RangingError) {
        let cb = self.deps.callback.clone();
        self.dispatch(move || cb.on_start_failed(peer, reason));
    }

    fn advance_to_starting(&mut self) {
        let mut state = self.state.lock();
        if *state == SessionState::Negotiating
            && self.peers.values().all(|p| p.negotiation_complete)
        {
            *state = SessionState::Starting;
        }
    }

    fn mark_negotiation_complete(&mut self, peer_id: PeerId) {
        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.negotiation_complete = true;
        }
        self.advance_to_starting();
    }

    fn on_start(&mut self, pref: StartPreference) {
        if *self.state.lock() != SessionState::Init {
            log::warn!("session {}: spurious start() ignored", self.id);
            return;
        }

        self.role = pref.role;
        self.measurement_limit = pref.measurement_limit;
        self.notification_policy = pref.notification_policy;
        self.sensor_fusion = pref.sensor_fusion;

        *self.state.lock() = SessionState::Negotiating;

        for (peer_id, kind) in pref.peers {
            self.peers.entry(peer_id).or_insert_with(|| PeerEntry::new(peer_id));
            self.configure_peer(peer_id, kind);
        }

        self.advance_to_starting();
    }

    fn configure_peer(&mut self, peer_id: PeerId, kind: PeerStartKind) {
        match kind {
            PeerStartKind::Raw(config) => {
                let technology = config.technology();
                self.start_adapter(peer_id, technology, config);
                self.mark_negotiation_complete(peer_id);
            }
            PeerStartKind::Oob(oob_pref) => match self.role {
                DeviceRole::Initiator => {
                    let conn = self.peers.get(&peer_id).and_then(|p| p.oob.clone());
                    let Some(conn) = conn else {
                        log::warn!(
                            "session {}: peer {} has no OOB connection, dropping",
                            self.id,
                            peer_id
                        );
                        self.dispatch_start_failed(peer_id, RangingError::InvalidConfig);
                        self.mark_negotiation_complete(peer_id);
                        return;
                    };

                    let local = self.deps.capability_provider.local_capabilities();
                    let timeouts = self.deps.timeouts.negotiation;
                    let tx = self.tx.clone();

                    tokio::spawn(async move {
                        let result =
                            negotiation::negotiate_initiator(&conn, &local, &oob_pref, &timeouts)
                                .await;
                        let _ = tx.send(SessionMessage::NegotiationDone { peer: peer_id, result });
                    });
                }
                DeviceRole::Responder => {
                    self.maybe_spawn_responder_loop(peer_id);
                }
            },
        }
    }

    fn maybe_spawn_responder_loop(&mut self, peer_id: PeerId) {
        let Some(entry) = self.peers.get_mut(&peer_id) else { return };
        if entry.responder_loop_spawned {
            return;
        }
        let Some(conn) = entry.oob.clone() else { return };
        entry.responder_loop_spawned = true;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                match conn.receive().await {
                    Ok(bytes) => match Message::decode(&bytes) {
                        Ok(message) => {
                            if tx.send(SessionMessage::OobInbound { peer: peer_id, message }).is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("peer {}: malformed OOB message dropped: {}", peer_id, e)
                        }
                    },
                    Err(_) => return,
                }
            }
        });
    }

    fn spawn_send(&self, peer_id: PeerId, message: Message) {
        let Some(conn) = self.peers.get(&peer_id).and_then(|p| p.oob.clone()) else { return };
        tokio::spawn(async move {
            let _ = conn.send(Bytes::from(message.encode())).await;
        });
    }

    fn start_adapter(&mut self, peer_id: PeerId, technology: Technology, config: ConfigBlock) {
        let Some(adapter) = self.deps.adapters.get(&technology).cloned() else {
            log::warn!(
                "session {}: no adapter registered for {:?}",
                self.id,
                technology
            );
            self.dispatch_start_failed(peer_id, RangingError::FailedToStart);
            return;
        };

        let entry = self.peers.entry(peer_id).or_insert_with(|| PeerEntry::new(peer_id));
        entry.technology = Some(technology);

        let callback = Arc::new(SessionAdapterCallback { tx: self.tx.clone(), technology });
        adapter.start(peer_id, config, callback);
    }

    fn on_add_peer(
        &mut self,
        peer_id: PeerId,
        kind: PeerStartKind,
        transport: Option<Arc<dyn TransportHandle>>,
    ) {
        {
            let entry = self.peers.entry(peer_id).or_insert_with(|| PeerEntry::new(peer_id));
            if let Some(transport) = transport {
                entry.oob = Some(OobConnection::new(transport, self.deps.timeouts.oob_disconnect));
            }
        }

        match *self.state.lock() {
            SessionState::Init => {
                // Registered ahead of `start()`; configured once the
                // preference map is walked there.
            }
            SessionState::Ranging => self.configure_peer(peer_id, kind),
            _ => log::warn!(
                "session {}: add_peer outside INIT/RANGING ignored for peer {}",
                self.id,
                peer_id
            ),
        }
    }

    fn on_remove_peer(&mut self, peer_id: PeerId) {
        let Some(entry) = self.peers.get_mut(&peer_id) else { return };

        if entry.adapter_live {
            if let Some(tech) = entry.technology {
                if let Some(adapter) = self.deps.adapters.get(&tech) {
                    adapter.stop(peer_id);
                }
            }
            entry.pending_removal = true;
            return;
        }

        if let Some(conn) = entry.oob.take() {
            conn.close();
        }

        self.peers.remove(&peer_id);
        if self.peers.is_empty() {
            // "Removing the last peer implicitly stops the session" (spec §4.2).
            self.begin_stop(ClosedReason::Requested);
        }
    }

    fn on_negotiation_done(&mut self, peer_id: PeerId, result: Result<NegotiatedConfig, RangingError>) {
        match result {
            Ok(negotiated) => {
                self.start_adapter(peer_id, negotiated.selection.technology, negotiated.selection.config);
            }
            Err(reason) => {
                log::warn!(
                    "session {}: negotiation failed for peer {}: {}",
                    self.id,
                    peer_id,
                    reason
                );
                self.dispatch_start_failed(peer_id, reason);
                self.mark_negotiation_complete(peer_id);
                if !reason.is_peer_scoped() {
                    // Not specific to this peer (the caller's own preference
                    // is invalid, or the local device supports nothing the
                    // caller accepted): every peer would fail identically,
                    // so the whole session ends instead of limping on peer
                    // by peer (spec §7 "Policy").
                    self.begin_stop(ClosedReason::from(reason));
                }
                return;
            }
        }
        self.mark_negotiation_complete(peer_id);
    }

    fn on_oob_inbound(&mut self, peer_id: PeerId, message: Message) {
        match message {
            Message::CapabilityRequest { technologies } => {
                let local = self.deps.capability_provider.local_capabilities();
                let responder = Responder { local_capabilities: &local };
                let reply = responder.handle_capability_request(technologies);
                self.spawn_send(peer_id, reply);
            }
            Message::SetConfiguration { technologies, configs, .. } => {
                let local = self.deps.capability_provider.local_capabilities();
                let responder = Responder { local_capabilities: &local };
                let reply = responder.handle_set_configuration(technologies, &configs);

                if let Message::SetConfigurationResponse { statuses } = &reply {
                    for (tech, status) in statuses {
                        if *status == ConfigStatus::Ok {
                            if let Some(block) = configs.iter().find(|c| c.technology() == *tech) {
                                if let Some(entry) = self.peers.get_mut(&peer_id) {
                                    entry.pending_responder_config = Some((*tech, block.clone()));
                                }
                            }
                        }
                    }
                }

                self.spawn_send(peer_id, reply);
            }
            Message::StartRanging { technologies } => {
                let mut successful = TechnologySet::empty();
                let pending = self
                    .peers
                    .get(&peer_id)
                    .and_then(|p| p.pending_responder_config.clone());

                if let Some((tech, config)) = pending {
                    if technologies.contains(tech) {
                        self.start_adapter(peer_id, tech, config);
                        successful.insert(tech);
                    }
                }

                self.spawn_send(peer_id, Message::StartRangingResponse { successful });
                self.mark_negotiation_complete(peer_id);
            }
            Message::StopRanging { technologies } => {
                self.spawn_send(peer_id, Message::StopRangingResponse { technologies });
                let tech = self.peers.get(&peer_id).and_then(|p| p.technology);
                if let Some(tech) = tech {
                    if let Some(adapter) = self.deps.adapters.get(&tech) {
                        adapter.stop(peer_id);
                    }
                }
            }
            other => {
                log::debug!(
                    "session {}: ignoring {:?} from peer {}",
                    self.id,
                    other.message_type(),
                    peer_id
                );
            }
        }
    }

    fn on_adapter_started(&mut self, peer_id: PeerId, technology: Technology) {
        let Some(entry) = self.peers.get_mut(&peer_id) else { return };
        entry.adapter_live = true;
        entry.last_data_at = Some(Instant::now());

        if !entry.started_notified {
            entry.started_notified = true;
            let cb = self.deps.callback.clone();
            self.dispatch(move || cb.on_started(peer_id, technology));
        }

        let mut state = self.state.lock();
        if *state == SessionState::Starting {
            *state = SessionState::Ranging;
        }
    }

    fn on_adapter_closed(&mut self, peer_id: PeerId, _technology: Technology, reason: AdapterClosedReason) {
        let Some(entry) = self.peers.get_mut(&peer_id) else { return };
        entry.adapter_live = false;

        if !entry.stopped_notified {
            entry.stopped_notified = true;
            let cb = self.deps.callback.clone();
            self.dispatch(move || cb.on_ranging_stopped(peer_id));
        }

        if entry.pending_removal {
            self.peers.remove(&peer_id);
            if self.peers.is_empty() {
                self.begin_stop(ClosedReason::Requested);
                return;
            }
        }

        match *self.state.lock() {
            SessionState::Stopping => self.maybe_finish_termination(),
            SessionState::Negotiating | SessionState::Starting | SessionState::Ranging => {
                let all_done = self
                    .peers
                    .values()
                    .all(|p| !p.adapter_live && p.negotiation_complete);
                if reason != AdapterClosedReason::Requested && all_done && !self.peers.is_empty() {
                    // All peers have no live adapter left and none is still
                    // negotiating: spec §4.2 "a session transitions to
                    // STOPPING... on all peers closed".
                    self.begin_stop(ClosedReason::Error);
                }
            }
            SessionState::Init | SessionState::Terminated => {}
        }
    }

    fn on_adapter_data(&mut self, peer_id: PeerId, measurement: RangingMeasurement) {
        if matches!(
            *self.state.lock(),
            SessionState::Stopping | SessionState::Terminated | SessionState::Init
        ) {
            return;
        }

        if !measurement.is_well_formed() {
            log::warn!(
                "session {}: dropping non-finite measurement from peer {}",
                self.id,
                peer_id
            );
            return;
        }

        if !self.timestamps.accept(peer_id, measurement.timestamp_ns) {
            log::warn!(
                "session {}: dropping out-of-order measurement from peer {}",
                self.id,
                peer_id
            );
            return;
        }

        let Some(entry) = self.peers.get_mut(&peer_id) else { return };
        if !entry.adapter_live {
            return;
        }
        entry.last_data_at = Some(Instant::now());
        entry.no_data_warned = false;

        let outputs = if self.sensor_fusion && !entry.fusion_reverted {
            match &self.deps.fusion {
                Some(fusion) => {
                    let fused = fusion.feed(peer_id, measurement);
                    if !fused.is_empty() {
                        entry.last_fusion_output_at = Some(Instant::now());
                    }
                    fused
                }
                None => vec![measurement],
            }
        } else {
            vec![measurement]
        };

        if !matches!(self.notification_policy, DataNotificationPolicy::Disabled) {
            for m in outputs {
                let cb = self.deps.callback.clone();
                self.dispatch(move || cb.on_data(peer_id, m));
            }
        }

        self.round_peers.insert(peer_id);
        let active: HashSet<PeerId> =
            self.peers.values().filter(|p| p.adapter_live).map(|p| p.id).collect();

        if !active.is_empty() && active.is_subset(&self.round_peers) {
            self.round_peers.clear();
            self.round_count += 1;
            if self.measurement_limit != 0 && self.round_count >= self.measurement_limit {
                self.begin_stop(ClosedReason::LimitReached);
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let no_data_timeout = self.deps.timeouts.adapter_no_data;
        let fusion_timeout = self.deps.timeouts.fusion_drift;
        let sensor_fusion = self.sensor_fusion;

        for entry in self.peers.values_mut() {
            if !entry.adapter_live {
                continue;
            }

            if let Some(last) = entry.last_data_at {
                if !entry.no_data_warned && now.duration_since(last) > no_data_timeout {
                    entry.no_data_warned = true;
                    log::warn!(
                        "peer {}: no ranging data for over {:?} (NO_DATA)",
                        entry.id,
                        no_data_timeout
                    );
                }
            }

            if sensor_fusion && !entry.fusion_reverted {
                if let Some(last_fusion) = entry.last_fusion_output_at {
                    if now.duration_since(last_fusion) > fusion_timeout {
                        entry.fusion_reverted = true;
                        log::warn!(
                            "peer {}: fusion filter silent for over {:?}, reverting to raw measurements",
                            entry.id,
                            fusion_timeout
                        );
                    }
                }
            }
        }
    }

    fn on_stop_deadline(&mut self) {
        if *self.state.lock() != SessionState::Stopping {
            return;
        }

        let stuck: Vec<PeerId> =
            self.peers.values().filter(|p| p.adapter_live).map(|p| p.id).collect();

        for peer_id in stuck {
            log::warn!(
                "session {}: peer {} adapter stuck past stop-drain deadline, abandoning",
                self.id,
                peer_id
            );
            if let Some(entry) = self.peers.get_mut(&peer_id) {
                entry.adapter_live = false;
                if !entry.stopped_notified {
                    entry.stopped_notified = true;
                    let cb = self.deps.callback.clone();
                    self.dispatch(move || cb.on_ranging_stopped(peer_id));
                }
            }
        }

        self.maybe_finish_termination();
    }

    fn begin_stop(&mut self, reason: ClosedReason) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Stopping | SessionState::Terminated) {
                return;
            }
            if *state == SessionState::Init {
                *state = SessionState::Terminated;
                drop(state);
                self.finish_termination(reason);
                return;
            }
            *state = SessionState::Stopping;
        }

        self.pending_close_reason = Some(reason);

        for (peer_id, entry) in self.peers.iter() {
            let Some(tech) = entry.technology else { continue };

            if entry.adapter_live {
                if let Some(adapter) = self.deps.adapters.get(&tech) {
                    adapter.stop(*peer_id);
                }
            }

            if let Some(conn) = entry.oob.clone() {
                let timeout = self.deps.timeouts.negotiation.start;
                let techs = TechnologySet::new(&[tech]);
                tokio::spawn(async move {
                    if let Err(e) = negotiation::negotiate_stop(&conn, techs, timeout).await {
                        log::warn!("oob stop negotiation failed: {}", e);
                    }
                });
            }
        }

        let tx = self.tx.clone();
        let drain = self.deps.timeouts.stop_drain;
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            let _ = tx.send(SessionMessage::StopDeadline);
        });

        self.maybe_finish_termination();
    }

    fn maybe_finish_termination(&mut self) {
        if *self.state.lock() != SessionState::Stopping {
            return;
        }
        if self.peers.values().any(|p| p.adapter_live) {
            return;
        }
        let reason = self.pending_close_reason.unwrap_or(ClosedReason::Requested);
        self.finish_termination(reason);
    }

    fn finish_termination(&mut self, reason: ClosedReason) {
        *self.state.lock() = SessionState::Terminated;

        // The Session exclusively owns its peers' OOB connections (spec §3);
        // any peer not already removed via `on_remove_peer` still holds one
        // open here, and its responder loop only exits once `close()` runs.
        for entry in self.peers.values_mut() {
            if let Some(conn) = entry.oob.take() {
                conn.close();
            }
        }

        let cb = self.deps.callback.clone();
        self.dispatch(move || cb.on_closed(reason));

        if let Some(registry) = &self.registry {
            registry.remove(self.id);
        }
    }
}
