use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use web_time::{Duration, Instant};

use crate::error::NetplayError;
use crate::input_queue::{ConsumeOutcome, InputFrame, InputQueue, LocalInput};
use crate::network::messages::{ControlMessage, InputMessage, PlayerInfo, PlayerList};
use crate::network::transport::{
    Channel, Delivery, PeerId, Transport, TransportEvent, TransportFactory,
};
use crate::report_violation_to;
use crate::sessions::config::SessionConfig;
use crate::sessions::event_drain::EventDrain;
use crate::sessions::game_start::InstanceMap;
use crate::sessions::handshake::{ClientHandshake, HandshakeStep, HostHandshake, InfoRejection};
use crate::sessions::player_registry::{
    PlayerName, PlayerRecord, PlayerRegistry, PlayerStatus, LOOPBACK,
};
use crate::sessions::session_health::SessionHealth;
use crate::telemetry::{
    report_to_observer, ProtocolViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{Frame, NetplayEvent, PlayerId, SessionState, Simulation, MAX_PLAYERS};

/// Maximum number of events to queue before oldest are dropped.
const MAX_EVENT_QUEUE_SIZE: usize = 256;

/// What one [`NetplaySession::process`] call did for its instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The game has not started. Nothing was applied.
    Idle,
    /// The input for `Frame` was applied; the instance may advance.
    Applied(Frame),
    /// The input for the current frame has not arrived. Do not advance.
    Waiting,
    /// The instance's queue is empty. Do not advance; see [`NetplaySession::health`].
    Starved,
}

impl ProcessOutcome {
    /// Returns `true` if the instance may run its frame.
    #[must_use]
    pub const fn may_advance(self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// One participant's view of a netplay session.
///
/// A session is the explicit context every operation goes through: it owns the
/// transport endpoint, the per-player input queues and the instance mapping,
/// and shares the [`PlayerRegistry`] with whoever wants to read the roster.
///
/// The application drives it from the simulation thread:
///
/// ```ignore
/// session.start_as_host("Host", 8064)?;
/// // lobby: poll until everyone is in
/// session.poll_network();
/// session.start_game()?;
/// loop {
///     session.add_local_input(read_pad())?;
///     for instance in 0..session.state().instances.len() {
///         if session.process(instance, &mut sim)?.may_advance() {
///             sim.run_frame(instance);
///         }
///     }
/// }
/// ```
pub struct NetplaySession {
    config: SessionConfig,
    state: SessionState,
    registry: Arc<PlayerRegistry>,
    factory: Box<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    /// Host-side slot bookkeeping. `None` on clients.
    host: Option<HostHandshake>,
    /// Connection to the host. `None` on the host.
    host_peer: Option<PeerId>,
    /// Client-to-client connections.
    mesh_links: BTreeMap<PeerId, PlayerId>,
    queues: Vec<InputQueue>,
    local_input: LocalInput,
    event_queue: VecDeque<NetplayEvent>,
    health: SessionHealth,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for NetplaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            state,
            registry,
            factory: _,
            transport,
            host,
            host_peer,
            mesh_links,
            queues,
            local_input,
            event_queue,
            health,
            violation_observer,
        } = self;

        f.debug_struct("NetplaySession")
            .field("config", config)
            .field("state", state)
            .field("registry", registry)
            .field(
                "local_addr",
                &transport.as_ref().map(|transport| transport.local_addr()),
            )
            .field("host", host)
            .field("host_peer", host_peer)
            .field("mesh_links", mesh_links)
            .field("queued_inputs", &queues.iter().map(InputQueue::len).sum::<usize>())
            .field("local_input", local_input)
            .field("pending_events", &event_queue.len())
            .field("health", health)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl NetplaySession {
    pub(crate) fn new(
        config: SessionConfig,
        factory: Box<dyn TransportFactory>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            config,
            state: SessionState::default(),
            registry: Arc::new(PlayerRegistry::new()),
            factory,
            transport: None,
            host: None,
            host_peer: None,
            mesh_links: BTreeMap::new(),
            queues: (0..MAX_PLAYERS).map(|_| InputQueue::new()).collect(),
            local_input: LocalInput::default(),
            event_queue: VecDeque::new(),
            health: SessionHealth::Healthy,
            violation_observer,
        }
    }

    /// Opens a session as host on `port`.
    ///
    /// The host occupies slot 0 and accepts joins until the game starts or the
    /// roster reaches [`SessionConfig::max_players`].
    ///
    /// # Errors
    /// - [`NetplayError::SessionAlreadyActive`] if this session is hosting or joined.
    /// - [`NetplayError::Transport`] if the endpoint cannot be created.
    pub fn start_as_host(&mut self, name: &str, port: u16) -> Result<(), NetplayError> {
        if self.state.active {
            return Err(NetplayError::SessionAlreadyActive);
        }
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let transport = self
            .factory
            .create_host(bind, MAX_PLAYERS, self.config.channel_count)?;

        let record = PlayerRecord {
            id: PlayerId::HOST,
            name: PlayerName::new(name),
            status: PlayerStatus::Host,
            address: LOOPBACK,
            is_local: true,
        };
        self.registry.clear();
        self.registry.set_local(PlayerId::HOST);
        self.registry.upsert(record.clone());

        info!(
            "hosting as {:?} on {} for up to {} players",
            record.name.as_str(),
            transport.local_addr(),
            self.config.max_players
        );
        self.reset_context();
        self.state = SessionState {
            active: true,
            is_host: true,
            running: false,
            my_player: record,
            host_address: Some(transport.local_addr()),
            max_players: self.config.max_players,
            port,
            instances: InstanceMap::default(),
        };
        self.host = Some(HostHandshake::new(self.config.max_players));
        self.transport = Some(transport);
        Ok(())
    }

    /// Joins the session hosted at `host:port`, blocking until the host assigns
    /// a slot or the handshake fails.
    ///
    /// Nothing is kept from a failed attempt.
    ///
    /// # Errors
    /// - [`NetplayError::SessionAlreadyActive`] if this session is hosting or joined.
    /// - [`NetplayError::Transport`] if the endpoint or the connection cannot be created.
    /// - [`NetplayError::HandshakeTimeout`] if the host does not connect or answer in time.
    /// - [`NetplayError::HandshakeRejected`] if the host's init is incompatible or malformed.
    /// - [`NetplayError::Disconnected`] if the host closes the connection.
    pub fn start_as_client(
        &mut self,
        name: &str,
        host: IpAddr,
        port: u16,
    ) -> Result<(), NetplayError> {
        if self.state.active {
            return Err(NetplayError::SessionAlreadyActive);
        }
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let mut transport = self
            .factory
            .create_host(bind, MAX_PLAYERS, self.config.channel_count)?;
        let host_addr = SocketAddr::new(host, port);
        let host_peer = transport.connect(host_addr)?;
        debug!("joining {} as {}", host_addr, transport.local_addr());

        let mut handshake = ClientHandshake::new(host_peer, self.config.handshake_timeout);
        let init = loop {
            let Some(remaining) = handshake.remaining() else {
                transport.disconnect(host_peer);
                return Err(handshake.expire());
            };
            let Some(event) = transport.poll(remaining) else {
                continue;
            };
            match handshake.on_event(event) {
                HandshakeStep::Pending => {},
                HandshakeStep::Assigned(init) => break init,
                HandshakeStep::Failed(err) => {
                    warn!("join of {} failed: {}", host_addr, err);
                    transport.disconnect(host_peer);
                    return Err(err);
                },
            }
        };

        let my_id = PlayerId::new(init.assigned_id);
        let record = PlayerRecord {
            id: my_id,
            name: PlayerName::new(name),
            status: PlayerStatus::Client,
            address: LOOPBACK,
            is_local: true,
        };
        let info = ControlMessage::PlayerInfo(PlayerInfo::new(record.clone())).encode()?;
        if let Err(err) = transport.send(host_peer, Channel::CONTROL, &info, Delivery::Reliable) {
            transport.disconnect(host_peer);
            return Err(err.into());
        }

        self.registry.clear();
        self.registry.set_local(my_id);
        self.registry.set_host_address(host);
        self.registry.upsert(record.clone());

        info!(
            "joined {} as player {} of {}",
            host_addr, my_id, init.max_players
        );
        self.reset_context();
        self.state = SessionState {
            active: true,
            is_host: false,
            running: false,
            my_player: record,
            host_address: Some(host_addr),
            max_players: init.max_players,
            port,
            instances: InstanceMap::default(),
        };
        self.host_peer = Some(host_peer);
        self.transport = Some(transport);
        Ok(())
    }

    /// Closes every connection and clears the roster, the queues and the session context.
    ///
    /// Queued events and the last [`health`](Self::health) fault survive so the
    /// application can still see why a session ended. Calling this on an
    /// inactive session does nothing.
    pub fn end_session(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            for peer in transport.peers() {
                transport.disconnect(peer);
            }
        }
        if self.state.active {
            info!("session ended");
        }
        self.registry.clear();
        self.state = SessionState::default();
        self.host = None;
        self.host_peer = None;
        self.mesh_links.clear();
        for queue in &mut self.queues {
            queue.clear();
        }
        self.local_input = LocalInput::default();
    }

    fn reset_context(&mut self) {
        self.mesh_links.clear();
        for queue in &mut self.queues {
            queue.clear();
        }
        self.local_input = LocalInput::default();
        self.health = SessionHealth::Healthy;
    }

    /// Occupied roster slots in slot order. See [`PlayerRegistry::list_players`].
    #[must_use]
    pub fn player_list(&self) -> Vec<PlayerRecord> {
        self.registry.list_players()
    }

    /// Shared handle to the roster, readable from any thread.
    #[must_use]
    pub fn registry(&self) -> Arc<PlayerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Session context.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The settings this session was built with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The local player's slot, once hosting or joined.
    #[must_use]
    pub fn local_player(&self) -> Option<PlayerId> {
        self.state.active.then_some(self.state.my_player.id)
    }

    /// Address of the local endpoint, once hosting or joined.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|transport| transport.local_addr())
    }

    /// Last fault that prevented the session from advancing correctly.
    #[must_use]
    pub fn health(&self) -> SessionHealth {
        self.health.clone()
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    /// Drains the events queued since the last call.
    ///
    /// If more than `MAX_EVENT_QUEUE_SIZE` events pile up, the oldest are discarded.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// Sets the input sampled on every following tick until replaced.
    ///
    /// # Errors
    /// - [`NetplayError::SessionNotActive`] before hosting or joining.
    pub fn add_local_input(&mut self, input: LocalInput) -> Result<(), NetplayError> {
        if !self.state.active {
            return Err(NetplayError::SessionNotActive);
        }
        self.local_input = input;
        Ok(())
    }

    /// Host only: tells every peer to start, then starts locally.
    ///
    /// # Errors
    /// - [`NetplayError::SessionNotActive`] before hosting.
    /// - [`NetplayError::NotHost`] on a client.
    /// - [`NetplayError::GameAlreadyRunning`] if the game was started before.
    /// - [`NetplayError::Transport`] if the start message cannot be sent.
    pub fn start_game(&mut self) -> Result<(), NetplayError> {
        if !self.state.active {
            return Err(NetplayError::SessionNotActive);
        }
        if !self.state.is_host {
            return Err(NetplayError::NotHost);
        }
        if self.state.running {
            return Err(NetplayError::GameAlreadyRunning);
        }
        let message = ControlMessage::StartGame.encode()?;
        if let Some(transport) = self.transport.as_mut() {
            transport.broadcast(Channel::CONTROL, &message, Delivery::Reliable)?;
        }
        self.start_locally();
        Ok(())
    }

    fn start_locally(&mut self) {
        let local = self.state.my_player.id;
        let instances = InstanceMap::assign(local, &self.registry.snapshot());
        instances.prefill(&mut self.queues, self.config.lag_depth);
        let count = instances.len();
        info!(
            "game started: player {} on instance 0, {} instances, lag depth {}",
            local, count, self.config.lag_depth
        );
        self.state.instances = instances;
        self.state.running = true;
        self.push_event(NetplayEvent::GameStarted {
            local_player: local,
            instances: count,
        });
    }

    /// One simulation tick for `instance`.
    ///
    /// For instance 0 this first drains the network without waiting and, once the
    /// game runs, samples the local input for frame `current + lag_depth` and
    /// sends it to every peer. Then the input queue of the player driving
    /// `instance` is consulted; a ready input is applied through `sim`.
    ///
    /// Call it once per tick for every instance, instance 0 first.
    ///
    /// # Errors
    /// - [`NetplayError::SessionNotActive`] before hosting or joining.
    /// - [`NetplayError::InvalidRequest`] if the game runs and `instance` is not mapped.
    pub fn process<S: Simulation + ?Sized>(
        &mut self,
        instance: usize,
        sim: &mut S,
    ) -> Result<ProcessOutcome, NetplayError> {
        if !self.state.active {
            return Err(NetplayError::SessionNotActive);
        }
        if instance == 0 {
            self.poll_network();
            if self.state.running {
                self.send_local_input(sim.current_frame(0));
            }
        }
        // The network may have ended the session.
        if !self.state.running {
            return Ok(ProcessOutcome::Idle);
        }

        let Some(player) = self.state.instances.player_for(instance) else {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "instance {instance} is not mapped; {} instances in use",
                    self.state.instances.len()
                ),
            });
        };
        let current = sim.current_frame(instance);
        let Some(queue) = self.queues.get_mut(player.as_usize()) else {
            self.record_roster_desync(player);
            return Ok(ProcessOutcome::Starved);
        };

        match queue.consume(current) {
            ConsumeOutcome::Ready { input, dropped } => {
                if dropped > 0 {
                    self.report_dropped(player, dropped, input.frame);
                }
                sim.apply_input(instance, input.key_mask, input.touch());
                Ok(ProcessOutcome::Applied(input.frame))
            },
            ConsumeOutcome::Pending { next, dropped } => {
                if dropped > 0 {
                    self.report_dropped(player, dropped, next);
                }
                trace!(
                    "instance {} waiting: player {} next input is for {}, at {}",
                    instance,
                    player,
                    next,
                    current
                );
                Ok(ProcessOutcome::Waiting)
            },
            ConsumeOutcome::Starved => {
                if self.registry.get(player).is_some_and(|r| r.is_occupied()) {
                    self.record_starvation(player, current);
                } else {
                    self.record_roster_desync(player);
                }
                Ok(ProcessOutcome::Starved)
            },
        }
    }

    fn send_local_input(&mut self, current: Frame) {
        let me = self.state.my_player.id;
        let input = InputFrame::new(current.delayed_by(self.config.lag_depth), self.local_input);
        if let Some(queue) = self.queues.get_mut(me.as_usize()) {
            queue.push(input);
        }

        let payload = match (InputMessage { frame: input }).encode() {
            Ok(payload) => payload,
            Err(err) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::InputQueue,
                    "could not encode local input for frame {}: {}",
                    input.frame,
                    err
                );
                return;
            },
        };
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(err) = transport.broadcast(Channel::input(me), &payload, Delivery::Unreliable) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "local input for frame {} not sent: {}",
                input.frame,
                err
            );
        }
    }

    fn report_dropped(&mut self, player: PlayerId, dropped: usize, frame: Frame) {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::InputQueue,
            format!("discarded {dropped} stale input frames"),
            concat!(file!(), ":", line!()),
        )
        .with_frame(frame)
        .with_player(player);
        report_to_observer(self.violation_observer.as_ref(), &violation);
        self.push_event(NetplayEvent::FramesDropped {
            player,
            dropped,
            frame,
        });
    }

    fn record_starvation(&mut self, player: PlayerId, frame: Frame) {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Critical,
            ViolationKind::InputQueue,
            "input queue empty; simulation stalled",
            concat!(file!(), ":", line!()),
        )
        .with_frame(frame)
        .with_player(player);
        report_to_observer(self.violation_observer.as_ref(), &violation);
        self.health = SessionHealth::InputStarved { player, frame };
        self.push_event(NetplayEvent::InputStarved { player, frame });
    }

    fn record_roster_desync(&mut self, player: PlayerId) {
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Critical,
            ViolationKind::Roster,
            "instance mapped to player {} which is no longer in the roster",
            player
        );
        self.health = SessionHealth::RosterDesync {
            id: player.as_u8(),
        };
    }

    /// Handles every transport event queued right now, without waiting.
    ///
    /// [`process`](Self::process) calls this for instance 0. Call it directly to
    /// keep the lobby responsive before the game starts. On the host it also
    /// frees slots whose peers never registered within the handshake timeout.
    /// Returns the number of events handled.
    pub fn poll_network(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self
            .transport
            .as_mut()
            .and_then(|transport| transport.poll(Duration::ZERO))
        {
            handled += 1;
            if self.state.is_host {
                self.handle_host_event(event);
            } else {
                self.handle_client_event(event);
            }
        }
        if self.state.is_host {
            self.expire_stalled_joins();
        }
        handled
    }

    fn expire_stalled_joins(&mut self) {
        let timeout = self.config.handshake_timeout;
        let Some(host) = self.host.as_mut() else {
            return;
        };
        let expired = host.expire_pending(&self.registry, Instant::now(), timeout);
        if expired.is_empty() {
            return;
        }
        for (peer, slot) in expired {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Handshake,
                "{} never registered for slot {} within {:?}",
                peer,
                slot,
                timeout
            );
            if let Some(transport) = self.transport.as_mut() {
                transport.disconnect(peer);
            }
        }
        self.broadcast_roster();
    }

    fn handle_host_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, addr } => self.on_host_connect(peer, addr),
            TransportEvent::Disconnected { peer } => {
                let Some(host) = self.host.as_mut() else {
                    return;
                };
                if let Some(slot) = host.on_disconnect(&self.registry, peer) {
                    info!("player {} left", slot);
                    self.push_event(NetplayEvent::PlayerLeft { player: slot });
                    self.broadcast_roster();
                }
            },
            TransportEvent::Received {
                peer,
                channel,
                payload,
            } => {
                if channel == Channel::CONTROL {
                    self.on_host_control(peer, &payload);
                } else if let Some(player) = channel.input_player() {
                    self.on_input(peer, player, &payload);
                } else {
                    trace!("ignoring {} bytes on {} from {}", payload.len(), channel, peer);
                }
            },
        }
    }

    fn on_host_connect(&mut self, peer: PeerId, addr: SocketAddr) {
        let Some(host) = self.host.as_mut() else {
            return;
        };
        let accepted = host.on_connect(&self.registry, peer, addr, self.state.running);
        let init = match accepted {
            Ok(init) => init,
            Err(reason) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Handshake,
                    "rejected connection from {}: {}",
                    addr,
                    reason
                );
                if let Some(transport) = self.transport.as_mut() {
                    transport.disconnect(peer);
                }
                self.push_event(NetplayEvent::ConnectionRejected { addr, reason });
                return;
            },
        };

        let sent = ControlMessage::ClientInit(init)
            .encode()
            .map_err(NetplayError::from)
            .and_then(|bytes| {
                self.transport
                    .as_mut()
                    .ok_or(NetplayError::SessionNotActive)?
                    .send(peer, Channel::CONTROL, &bytes, Delivery::Reliable)
                    .map_err(NetplayError::from)
            });
        if let Err(err) = sent {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Handshake,
                "could not send init to {}: {}",
                addr,
                err
            );
            self.drop_host_peer(peer);
        }
    }

    fn on_host_control(&mut self, peer: PeerId, payload: &[u8]) {
        let info = match ControlMessage::decode(payload) {
            Ok(ControlMessage::PlayerInfo(info)) => info,
            Ok(other) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Handshake,
                    "unexpected control message from {}: {:?}",
                    peer,
                    other
                );
                return;
            },
            Err(err) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Handshake,
                    "malformed control message from {}: {}",
                    peer,
                    err
                );
                return;
            },
        };

        let observed = self
            .transport
            .as_ref()
            .and_then(|transport| transport.peer_addr(peer))
            .map(|addr| addr.ip());
        let Some(host) = self.host.as_mut() else {
            return;
        };
        let Some(observed) = observed else {
            return;
        };
        match host.on_player_info(&self.registry, peer, &info, observed) {
            Ok(record) => {
                info!("player {} joined as {:?}", record.id, record.name.as_str());
                self.push_event(NetplayEvent::PlayerJoined {
                    player: record.id,
                    name: record.name,
                });
                self.broadcast_roster();
            },
            Err(InfoRejection::UnknownPeer) => {
                trace!("player info from unassigned {}", peer);
            },
            Err(InfoRejection::Incompatible(reason)) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Handshake,
                    "player info from {} rejected: {}",
                    peer,
                    reason
                );
                self.drop_host_peer(peer);
            },
            Err(InfoRejection::IdMismatch { expected, reported }) => {
                let violation = ProtocolViolation::new(
                    ViolationSeverity::Error,
                    ViolationKind::Handshake,
                    format!("peer registered as player {reported}, assigned {expected}"),
                    concat!(file!(), ":", line!()),
                )
                .with_player(expected)
                .with_context("peer", peer.to_string());
                report_to_observer(self.violation_observer.as_ref(), &violation);
                self.drop_host_peer(peer);
            },
        }
    }

    /// Disconnects a peer and frees its slot.
    fn drop_host_peer(&mut self, peer: PeerId) {
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect(peer);
        }
        let freed = self
            .host
            .as_mut()
            .and_then(|host| host.on_disconnect(&self.registry, peer));
        if freed.is_some() {
            self.broadcast_roster();
        }
    }

    fn broadcast_roster(&mut self) {
        let list = HostHandshake::roster_message(&self.registry);
        let count = list.count;
        let result = ControlMessage::PlayerList(list)
            .encode()
            .map_err(NetplayError::from)
            .and_then(|bytes| match self.transport.as_mut() {
                Some(transport) => transport
                    .broadcast(Channel::CONTROL, &bytes, Delivery::Reliable)
                    .map_err(NetplayError::from),
                None => Ok(()),
            });
        match result {
            Ok(()) => debug!("roster of {} broadcast", count),
            Err(err) => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Roster,
                "roster broadcast failed: {}",
                err
            ),
        }
    }

    fn handle_client_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, addr } => self.on_client_connect(peer, addr),
            TransportEvent::Disconnected { peer } if Some(peer) == self.host_peer => {
                warn!("lost connection to the host");
                self.host_peer = None;
                self.health = SessionHealth::HostLost;
                self.push_event(NetplayEvent::HostLost);
                self.end_session();
            },
            TransportEvent::Disconnected { peer } => {
                if let Some(player) = self.mesh_links.remove(&peer) {
                    debug!("mesh link to player {} closed", player);
                }
            },
            TransportEvent::Received {
                peer,
                channel,
                payload,
            } => {
                if channel == Channel::CONTROL {
                    if Some(peer) == self.host_peer {
                        self.on_client_control(&payload);
                    } else {
                        trace!("control message from non-host {} ignored", peer);
                    }
                } else if let Some(player) = channel.input_player() {
                    self.on_input(peer, player, &payload);
                } else {
                    trace!("ignoring {} bytes on {} from {}", payload.len(), channel, peer);
                }
            },
        }
    }

    fn on_client_connect(&mut self, peer: PeerId, addr: SocketAddr) {
        if Some(peer) == self.host_peer || self.mesh_links.contains_key(&peer) {
            trace!("outbound connection to {} established", addr);
            return;
        }
        let matched = self
            .registry
            .find_by_address(addr.ip(), PlayerStatus::Connected)
            .filter(|id| !self.mesh_links.values().any(|linked| linked == id));
        match matched {
            Some(player) => {
                debug!("mesh link from player {} at {}", player, addr);
                self.mesh_links.insert(peer, player);
            },
            None => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Roster,
                    "inbound connection from {} matches no roster entry",
                    addr
                );
                if let Some(transport) = self.transport.as_mut() {
                    transport.disconnect(peer);
                }
            },
        }
    }

    fn on_client_control(&mut self, payload: &[u8]) {
        match ControlMessage::decode(payload) {
            Ok(ControlMessage::PlayerList(list)) => self.apply_roster(&list),
            Ok(ControlMessage::StartGame) => {
                if self.state.running {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::GameStart,
                        "duplicate start from the host ignored"
                    );
                } else {
                    self.start_locally();
                }
            },
            Ok(other) => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Handshake,
                "unexpected control message from the host: {:?}",
                other
            ),
            Err(err) => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Roster,
                "malformed control message from the host: {}",
                err
            ),
        }
    }

    fn apply_roster(&mut self, list: &PlayerList) {
        if !self.registry.replace_all(&list.players) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Roster,
                "inconsistent roster from the host ignored"
            );
            return;
        }

        let me = self.state.my_player.id;
        match self.registry.get(me).filter(PlayerRecord::is_occupied) {
            Some(record) => self.state.my_player = record,
            None => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Roster,
                    "roster from the host does not contain local player {}",
                    me
                );
                self.health = SessionHealth::RosterDesync { id: me.as_u8() };
            },
        }
        let players = self.registry.num_players();
        debug!("roster updated: {} players", players);
        self.push_event(NetplayEvent::RosterUpdated { players });
        self.connect_mesh();
    }

    /// Opens connections to registered clients that have none yet.
    ///
    /// Only the side with the higher id dials, so each pair gets one link.
    fn connect_mesh(&mut self) {
        let me = self.state.my_player.id;
        let port = self.state.port;
        let targets: Vec<PlayerRecord> = self
            .registry
            .list_players()
            .into_iter()
            .filter(|record| {
                record.status == PlayerStatus::Connected
                    && !record.is_local
                    && record.id < me
                    && !self.mesh_links.values().any(|linked| *linked == record.id)
            })
            .collect();

        for record in targets {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            let addr = SocketAddr::new(record.address, port);
            match transport.connect(addr) {
                Ok(peer) => {
                    debug!("mesh connect to player {} at {}", record.id, addr);
                    self.mesh_links.insert(peer, record.id);
                },
                Err(err) => report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Transport,
                    "mesh connect to player {} failed: {}",
                    record.id,
                    err
                ),
            }
        }
    }

    fn sender_slot(&self, peer: PeerId) -> Option<PlayerId> {
        if let Some(host) = self.host.as_ref() {
            return host.slot_of(peer);
        }
        if Some(peer) == self.host_peer {
            return Some(PlayerId::HOST);
        }
        self.mesh_links.get(&peer).copied()
    }

    fn on_input(&mut self, peer: PeerId, player: PlayerId, payload: &[u8]) {
        if self.sender_slot(peer) != Some(player) || player == self.state.my_player.id {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::InputQueue,
                "input for player {} from {} dropped: sender does not own the channel",
                player,
                peer
            );
            return;
        }
        match InputMessage::decode(payload) {
            Ok(message) => {
                if let Some(queue) = self.queues.get_mut(player.as_usize()) {
                    queue.push(message.frame);
                }
            },
            Err(err) => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::InputQueue,
                "malformed input from player {}: {}",
                player,
                err
            ),
        }
    }

    fn push_event(&mut self, event: NetplayEvent) {
        if self.event_queue.len() >= MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
        self.event_queue.push_back(event);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::memory_transport::MemoryNetwork;
    use crate::telemetry::CollectingObserver;
    use crate::SessionBuilder;

    const PORT: u16 = 8064;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn session(network: &MemoryNetwork, last: u8) -> NetplaySession {
        SessionBuilder::new()
            .with_transport_factory(network.factory(ip(last)))
            .build()
            .unwrap()
    }

    #[test]
    fn outcome_only_advances_when_applied() {
        assert!(ProcessOutcome::Applied(Frame::ZERO).may_advance());
        assert!(!ProcessOutcome::Waiting.may_advance());
        assert!(!ProcessOutcome::Starved.may_advance());
        assert!(!ProcessOutcome::Idle.may_advance());
    }

    #[test]
    fn host_bootstraps_slot_zero() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, 1);
        host.start_as_host("Host", PORT).unwrap();

        let players = host.player_list();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].id, PlayerId::HOST);
        assert_eq!(players[0].status, PlayerStatus::Host);
        assert_eq!(players[0].address, LOOPBACK);
        assert!(host.state().is_host);
        assert_eq!(host.local_player(), Some(PlayerId::HOST));
    }

    #[test]
    fn hosting_twice_is_rejected() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, 1);
        host.start_as_host("Host", PORT).unwrap();
        assert_eq!(
            host.start_as_host("Host", PORT),
            Err(NetplayError::SessionAlreadyActive)
        );
    }

    #[test]
    fn inactive_session_refuses_work() {
        let network = MemoryNetwork::new();
        let mut idle = session(&network, 1);
        assert_eq!(idle.start_game(), Err(NetplayError::SessionNotActive));
        assert_eq!(
            idle.add_local_input(LocalInput::default()),
            Err(NetplayError::SessionNotActive)
        );
        assert_eq!(idle.local_player(), None);
    }

    #[test]
    fn join_without_host_fails_and_keeps_nothing() {
        let network = MemoryNetwork::new();
        let mut client = session(&network, 2);
        let result = client.start_as_client("Guest", ip(1), PORT);
        assert!(matches!(result, Err(NetplayError::Transport(_))));
        assert!(!client.state().active);
        assert!(client.player_list().is_empty());
        assert!(!network.is_bound(SocketAddr::new(ip(2), PORT)));
    }

    #[test]
    fn host_rejects_connections_after_start() {
        let network = MemoryNetwork::new();
        let observer = Arc::new(CollectingObserver::new());
        let mut host = SessionBuilder::new()
            .with_transport_factory(network.factory(ip(1)))
            .with_violation_observer(observer.clone())
            .build()
            .unwrap();
        host.start_as_host("Host", PORT).unwrap();
        host.start_game().unwrap();

        let mut late = network
            .factory(ip(2))
            .create_host(SocketAddr::new(ip(2), PORT), 1, 18)
            .unwrap();
        late.connect(SocketAddr::new(ip(1), PORT)).unwrap();
        host.poll_network();

        let events: Vec<_> = host.events().collect();
        assert!(events.iter().any(|event| matches!(
            event,
            NetplayEvent::ConnectionRejected {
                reason: crate::RejectReason::GameRunning,
                ..
            }
        )));
        assert_eq!(host.player_list().len(), 1);
        assert!(observer.has_violation(ViolationKind::Handshake));
    }

    #[test]
    fn host_alone_runs_in_lockstep_with_itself() {
        struct Counter {
            frame: i32,
            applied: Vec<u32>,
        }
        impl Simulation for Counter {
            fn current_frame(&self, _instance: usize) -> Frame {
                Frame::new(self.frame)
            }
            fn apply_input(&mut self, _instance: usize, key_mask: u32, _touch: Option<crate::Touch>) {
                self.applied.push(key_mask);
            }
            fn reset(&mut self) {}
            fn load_cartridge(&mut self, _image: &[u8], _save: Option<&[u8]>) -> bool {
                true
            }
            fn serialize_state(&self) -> Vec<u8> {
                Vec::new()
            }
            fn deserialize_state(&mut self, _state: &[u8]) -> bool {
                true
            }
            fn set_console_type(&mut self, _console_type: u8) {}
        }

        let network = MemoryNetwork::new();
        let mut host = session(&network, 1);
        host.start_as_host("Host", PORT).unwrap();
        let mut sim = Counter {
            frame: 0,
            applied: Vec::new(),
        };
        assert_eq!(host.process(0, &mut sim), Ok(ProcessOutcome::Idle));

        host.start_game().unwrap();
        host.add_local_input(LocalInput {
            key_mask: 0x0F0,
            touch: None,
        })
        .unwrap();
        for frame in 0..8 {
            let outcome = host.process(0, &mut sim).unwrap();
            assert_eq!(outcome, ProcessOutcome::Applied(Frame::new(frame)));
            sim.frame += 1;
        }
        let lag = host.config().lag_depth;
        assert!(sim.applied[..lag].iter().all(|&mask| mask == crate::NEUTRAL_KEY_MASK));
        assert!(sim.applied[lag..].iter().all(|&mask| mask == 0x0F0));
        assert!(host.health().is_healthy());

        assert!(matches!(
            host.process(1, &mut sim),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn end_session_is_idempotent_and_frees_the_port() {
        let network = MemoryNetwork::new();
        let mut host = session(&network, 1);
        host.start_as_host("Host", PORT).unwrap();
        host.end_session();
        host.end_session();
        assert!(!host.state().active);
        assert!(host.player_list().is_empty());
        assert!(!network.is_bound(SocketAddr::new(ip(1), PORT)));
        host.start_as_host("Host", PORT).unwrap();
    }

    #[test]
    fn session_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<NetplaySession>();
    }
}
