//! Join handshake, both sides.
//!
//! ```text
//!  client                                   host
//!    | ---------- transport connect ----------> |  reserve lowest free slot (Connecting)
//!    | <--------- ClientInit{id, max} --------- |
//!    | ---------- PlayerInfo{record} ---------> |  slot := Connected
//!    | <--------- PlayerList (broadcast) ------ |
//! ```
//!
//! [`HostHandshake`] is driven by transport events on the host.
//! [`ClientHandshake`] is a small non-blocking state machine the joining side
//! feeds events into until it yields the assignment, fails, or runs out of time.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::error::HandshakeRejection;
use crate::network::messages::{
    control_tag, ClientInit, ControlMessage, PlayerInfo, PlayerList, CLIENT_INIT_LEN,
};
use crate::network::transport::{Channel, PeerId, TransportEvent};
use crate::sessions::player_registry::{PlayerName, PlayerRecord, PlayerRegistry, PlayerStatus};
use crate::{NetplayError, PlayerId, MAX_PLAYERS, NETPLAY_MAGIC, PROTOCOL_VERSION};

/// Why the host turned a connection away.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Every slot up to the capacity is taken.
    RosterFull,
    /// The game has already started.
    GameRunning,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RosterFull => write!(f, "roster full"),
            Self::GameRunning => write!(f, "game already running"),
        }
    }
}

/// Why the host refused a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoRejection {
    /// The peer never got a slot.
    UnknownPeer,
    /// Wrong magic or protocol version.
    Incompatible(HandshakeRejection),
    /// The peer registered for a slot it was not assigned.
    IdMismatch {
        /// Slot the host assigned.
        expected: PlayerId,
        /// Slot the peer reported.
        reported: u8,
    },
}

/// Checks magic and version of a handshake-phase message.
pub fn check_compatibility(magic: u32, version: u32) -> Result<(), HandshakeRejection> {
    if magic != NETPLAY_MAGIC {
        return Err(HandshakeRejection::WrongMagic { received: magic });
    }
    if version != PROTOCOL_VERSION {
        return Err(HandshakeRejection::VersionMismatch { received: version });
    }
    Ok(())
}

/// Validates the first message a joining client receives.
pub fn validate_client_init(
    channel: Channel,
    payload: &[u8],
) -> Result<ClientInit, HandshakeRejection> {
    if channel != Channel::CONTROL || payload.first() != Some(&control_tag::CLIENT_INIT) {
        return Err(HandshakeRejection::UnexpectedMessage);
    }
    if payload.len() != CLIENT_INIT_LEN {
        return Err(HandshakeRejection::MalformedLength {
            expected: CLIENT_INIT_LEN,
            actual: payload.len(),
        });
    }
    let init = match ControlMessage::decode(payload) {
        Ok(ControlMessage::ClientInit(init)) => init,
        _ => return Err(HandshakeRejection::UnexpectedMessage),
    };
    check_compatibility(init.magic, init.version)?;
    if init.max_players < 1 || init.max_players as usize > MAX_PLAYERS {
        return Err(HandshakeRejection::MaxPlayersOutOfRange {
            max_players: init.max_players,
        });
    }
    if init.assigned_id as usize >= MAX_PLAYERS {
        return Err(HandshakeRejection::AssignedIdOutOfRange {
            id: init.assigned_id,
        });
    }
    Ok(init)
}

/// Host-side slot bookkeeping.
///
/// Peers are linked to slots through a lookup table keyed by [`PeerId`]; the
/// roster itself lives in the [`PlayerRegistry`]. A reserved slot is tracked
/// as pending until the peer registers, so a silent peer can be expired.
#[derive(Debug, Clone)]
pub struct HostHandshake {
    max_players: u8,
    peer_slots: BTreeMap<PeerId, PlayerId>,
    pending: BTreeMap<PeerId, Instant>,
}

impl HostHandshake {
    /// Creates the bookkeeping for a roster of `max_players`.
    #[must_use]
    pub fn new(max_players: u8) -> Self {
        Self {
            max_players,
            peer_slots: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Roster capacity.
    #[must_use]
    pub const fn max_players(&self) -> u8 {
        self.max_players
    }

    /// Handles a new connection: reserves a slot and returns the init to send.
    pub fn on_connect(
        &mut self,
        registry: &PlayerRegistry,
        peer: PeerId,
        addr: SocketAddr,
        game_running: bool,
    ) -> Result<ClientInit, RejectReason> {
        if game_running {
            return Err(RejectReason::GameRunning);
        }
        let capacity = (self.max_players as usize).min(MAX_PLAYERS);
        if registry.num_players() >= capacity {
            return Err(RejectReason::RosterFull);
        }
        let slot = registry
            .lowest_free_slot(capacity)
            .ok_or(RejectReason::RosterFull)?;

        registry.upsert(PlayerRecord {
            id: slot,
            name: PlayerName::default(),
            status: PlayerStatus::Connecting,
            address: addr.ip(),
            is_local: false,
        });
        self.peer_slots.insert(peer, slot);
        self.pending.insert(peer, Instant::now());
        debug!("{} from {} reserved slot {}", peer, addr, slot);
        Ok(ClientInit::new(slot, self.max_players))
    }

    /// Handles a registration. On success the slot is `Connected` and the stored record is returned.
    pub fn on_player_info(
        &mut self,
        registry: &PlayerRegistry,
        peer: PeerId,
        info: &PlayerInfo,
        observed: IpAddr,
    ) -> Result<PlayerRecord, InfoRejection> {
        let slot = *self
            .peer_slots
            .get(&peer)
            .ok_or(InfoRejection::UnknownPeer)?;
        check_compatibility(info.magic, info.version).map_err(InfoRejection::Incompatible)?;
        if info.player.id != slot {
            return Err(InfoRejection::IdMismatch {
                expected: slot,
                reported: info.player.id.as_u8(),
            });
        }

        let record = PlayerRecord {
            id: slot,
            name: PlayerName::new(info.player.name.as_str()),
            status: PlayerStatus::Connected,
            address: observed,
            is_local: false,
        };
        registry.upsert(record.clone());
        self.pending.remove(&peer);
        trace!("slot {} registered as {:?}", slot, record.name.as_str());
        Ok(record)
    }

    /// Forgets a peer and frees its slot. Returns the freed slot.
    pub fn on_disconnect(&mut self, registry: &PlayerRegistry, peer: PeerId) -> Option<PlayerId> {
        self.pending.remove(&peer);
        let slot = self.peer_slots.remove(&peer)?;
        registry.clear_slot(slot);
        Some(slot)
    }

    /// Frees every slot whose peer has not registered within `timeout` of
    /// reserving it, as of `now`. Returns the expired peers and their slots.
    pub fn expire_pending(
        &mut self,
        registry: &PlayerRegistry,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(PeerId, PlayerId)> {
        let stalled: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, reserved)| now.saturating_duration_since(**reserved) >= timeout)
            .map(|(peer, _)| *peer)
            .collect();
        stalled
            .into_iter()
            .filter_map(|peer| self.on_disconnect(registry, peer).map(|slot| (peer, slot)))
            .collect()
    }

    /// Number of peers holding a slot without having registered.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Slot of a connected peer.
    #[must_use]
    pub fn slot_of(&self, peer: PeerId) -> Option<PlayerId> {
        self.peer_slots.get(&peer).copied()
    }

    /// Peer occupying a slot.
    #[must_use]
    pub fn peer_of(&self, slot: PlayerId) -> Option<PeerId> {
        self.peer_slots
            .iter()
            .find_map(|(peer, id)| (*id == slot).then_some(*peer))
    }

    /// The roster broadcast reflecting the registry right now.
    #[must_use]
    pub fn roster_message(registry: &PlayerRegistry) -> PlayerList {
        let players = registry.snapshot().to_vec();
        let count = players.iter().filter(|p| p.is_occupied()).count() as u8;
        PlayerList { count, players }
    }

    /// Drops every peer link.
    pub fn clear(&mut self) {
        self.peer_slots.clear();
        self.pending.clear();
    }
}

/// Where a join attempt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Waiting for the transport connection to the host.
    AwaitingConnect,
    /// Connected, waiting for the host's init.
    AwaitingInit,
    /// Init received and accepted.
    Complete,
    /// The attempt was abandoned.
    Failed,
}

/// What feeding an event into a [`ClientHandshake`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Keep polling.
    Pending,
    /// The host assigned a slot.
    Assigned(ClientInit),
    /// The attempt is over.
    Failed(NetplayError),
}

/// Joining side of the handshake.
///
/// Each phase gets the full timeout, measured from when the phase began.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    host: PeerId,
    timeout: Duration,
    phase_started: Instant,
    phase: ClientPhase,
}

impl ClientHandshake {
    /// Starts waiting on the connection to `host`.
    #[must_use]
    pub fn new(host: PeerId, timeout: Duration) -> Self {
        Self {
            host,
            timeout,
            phase_started: Instant::now(),
            phase: ClientPhase::AwaitingConnect,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Time left in the current phase, `None` once it has expired.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .checked_sub(self.phase_started.elapsed())
            .filter(|left| !left.is_zero())
    }

    /// The timeout error for the current phase, failing the attempt.
    pub fn expire(&mut self) -> NetplayError {
        self.phase = ClientPhase::Failed;
        NetplayError::HandshakeTimeout {
            waited_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Feeds one transport event.
    pub fn on_event(&mut self, event: TransportEvent) -> HandshakeStep {
        if matches!(self.phase, ClientPhase::Complete | ClientPhase::Failed) {
            return HandshakeStep::Pending;
        }
        match event {
            TransportEvent::Connected { peer, .. } if peer == self.host => {
                if self.phase == ClientPhase::AwaitingConnect {
                    self.phase = ClientPhase::AwaitingInit;
                    self.phase_started = Instant::now();
                    trace!("connected to host, awaiting init");
                }
                HandshakeStep::Pending
            },
            TransportEvent::Disconnected { peer } if peer == self.host => {
                self.phase = ClientPhase::Failed;
                HandshakeStep::Failed(NetplayError::Disconnected)
            },
            TransportEvent::Received {
                peer,
                channel,
                payload,
            } if peer == self.host => match validate_client_init(channel, &payload) {
                Ok(init) => {
                    self.phase = ClientPhase::Complete;
                    HandshakeStep::Assigned(init)
                },
                Err(reason) => {
                    self.phase = ClientPhase::Failed;
                    HandshakeStep::Failed(NetplayError::HandshakeRejected { reason })
                },
            },
            _ => HandshakeStep::Pending,
        }
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
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 8064)
    }

    fn host_registry() -> PlayerRegistry {
        let registry = PlayerRegistry::new();
        registry.set_local(PlayerId::HOST);
        registry.upsert(PlayerRecord {
            id: PlayerId::HOST,
            name: PlayerName::new("host"),
            status: PlayerStatus::Host,
            address: crate::sessions::player_registry::LOOPBACK,
            is_local: true,
        });
        registry
    }

    fn init_bytes(init: ClientInit) -> Vec<u8> {
        ControlMessage::ClientInit(init).encode().unwrap()
    }

    #[test]
    fn host_assigns_lowest_free_slot() {
        let registry = host_registry();
        let mut host = HostHandshake::new(4);

        let init = host
            .on_connect(&registry, PeerId::new(1), addr(2), false)
            .unwrap();
        assert_eq!(init.assigned_id, 1);
        assert_eq!(init.max_players, 4);
        assert_eq!(
            registry.get(PlayerId::new(1)).unwrap().status,
            PlayerStatus::Connecting
        );

        let init = host
            .on_connect(&registry, PeerId::new(2), addr(3), false)
            .unwrap();
        assert_eq!(init.assigned_id, 2);

        host.on_disconnect(&registry, PeerId::new(1));
        let init = host
            .on_connect(&registry, PeerId::new(3), addr(4), false)
            .unwrap();
        assert_eq!(init.assigned_id, 1);
    }

    #[test]
    fn host_rejects_when_full_or_running() {
        let registry = host_registry();
        let mut host = HostHandshake::new(2);
        host.on_connect(&registry, PeerId::new(1), addr(2), false)
            .unwrap();

        assert_eq!(
            host.on_connect(&registry, PeerId::new(2), addr(3), false),
            Err(RejectReason::RosterFull)
        );
        assert_eq!(registry.num_players(), 2);

        let mut open = HostHandshake::new(16);
        assert_eq!(
            open.on_connect(&registry, PeerId::new(3), addr(4), true),
            Err(RejectReason::GameRunning)
        );
    }

    #[test]
    fn player_info_must_match_the_assigned_slot() {
        let registry = host_registry();
        let mut host = HostHandshake::new(8);
        host.on_connect(&registry, PeerId::new(1), addr(2), false)
            .unwrap();

        let mut record = PlayerRecord::empty(PlayerId::new(5));
        record.status = PlayerStatus::Client;
        let result = host.on_player_info(
            &registry,
            PeerId::new(1),
            &PlayerInfo::new(record),
            addr(2).ip(),
        );
        assert_eq!(
            result,
            Err(InfoRejection::IdMismatch {
                expected: PlayerId::new(1),
                reported: 5
            })
        );
    }

    #[test]
    fn silent_reservations_expire_and_free_their_slot() {
        let registry = host_registry();
        let mut host = HostHandshake::new(3);
        let timeout = Duration::from_millis(50);
        host.on_connect(&registry, PeerId::new(1), addr(2), false)
            .unwrap();
        host.on_connect(&registry, PeerId::new(2), addr(3), false)
            .unwrap();
        let mut record = PlayerRecord::empty(PlayerId::new(2));
        record.status = PlayerStatus::Client;
        host.on_player_info(&registry, PeerId::new(2), &PlayerInfo::new(record), addr(3).ip())
            .unwrap();
        assert_eq!(host.pending_count(), 1);

        assert!(host
            .expire_pending(&registry, Instant::now(), timeout)
            .is_empty());
        let later = Instant::now() + timeout;
        assert_eq!(
            host.expire_pending(&registry, later, timeout),
            vec![(PeerId::new(1), PlayerId::new(1))]
        );
        assert_eq!(host.pending_count(), 0);
        assert!(!registry.get(PlayerId::new(1)).unwrap().is_occupied());
        assert_eq!(host.slot_of(PeerId::new(2)), Some(PlayerId::new(2)));

        let init = host
            .on_connect(&registry, PeerId::new(3), addr(4), false)
            .unwrap();
        assert_eq!(init.assigned_id, 1);
    }

    #[test]
    fn player_info_registers_the_peer() {
        let registry = host_registry();
        let mut host = HostHandshake::new(8);
        host.on_connect(&registry, PeerId::new(1), addr(2), false)
            .unwrap();

        let record = PlayerRecord {
            id: PlayerId::new(1),
            name: PlayerName::new("guest"),
            status: PlayerStatus::Client,
            address: crate::sessions::player_registry::LOOPBACK,
            is_local: false,
        };
        let stored = host
            .on_player_info(
                &registry,
                PeerId::new(1),
                &PlayerInfo::new(record),
                addr(2).ip(),
            )
            .unwrap();
        assert_eq!(stored.status, PlayerStatus::Connected);
        assert_eq!(stored.address, addr(2).ip());

        let list = HostHandshake::roster_message(&registry);
        assert_eq!(list.count, 2);
        assert_eq!(list.players.len(), MAX_PLAYERS);
    }

    #[test]
    fn player_info_with_wrong_version_is_incompatible() {
        let registry = host_registry();
        let mut host = HostHandshake::new(8);
        host.on_connect(&registry, PeerId::new(1), addr(2), false)
            .unwrap();
        let mut info = PlayerInfo::new(PlayerRecord::empty(PlayerId::new(1)));
        info.version = 2;
        assert_eq!(
            host.on_player_info(&registry, PeerId::new(1), &info, addr(2).ip()),
            Err(InfoRejection::Incompatible(
                HandshakeRejection::VersionMismatch { received: 2 }
            ))
        );
    }

    #[test]
    fn client_init_validation() {
        let good = ClientInit::new(PlayerId::new(3), 8);
        assert_eq!(
            validate_client_init(Channel::CONTROL, &init_bytes(good)),
            Ok(good)
        );

        assert_eq!(
            validate_client_init(Channel::BLOB, &init_bytes(good)),
            Err(HandshakeRejection::UnexpectedMessage)
        );

        let mut long = init_bytes(good);
        long.push(0);
        assert_eq!(
            validate_client_init(Channel::CONTROL, &long),
            Err(HandshakeRejection::MalformedLength {
                expected: 11,
                actual: 12
            })
        );

        let bad_magic = ClientInit {
            magic: 0x1234_5678,
            ..good
        };
        assert_eq!(
            validate_client_init(Channel::CONTROL, &init_bytes(bad_magic)),
            Err(HandshakeRejection::WrongMagic {
                received: 0x1234_5678
            })
        );

        let bad_id = ClientInit {
            assigned_id: 16,
            ..good
        };
        assert_eq!(
            validate_client_init(Channel::CONTROL, &init_bytes(bad_id)),
            Err(HandshakeRejection::AssignedIdOutOfRange { id: 16 })
        );

        let bad_max = ClientInit {
            max_players: 17,
            ..good
        };
        assert_eq!(
            validate_client_init(Channel::CONTROL, &init_bytes(bad_max)),
            Err(HandshakeRejection::MaxPlayersOutOfRange { max_players: 17 })
        );
    }

    #[test]
    fn client_state_machine_happy_path() {
        let host = PeerId::new(9);
        let mut handshake = ClientHandshake::new(host, Duration::from_secs(5));
        assert_eq!(handshake.phase(), ClientPhase::AwaitingConnect);

        let step = handshake.on_event(TransportEvent::Connected {
            peer: host,
            addr: addr(1),
        });
        assert_eq!(step, HandshakeStep::Pending);
        assert_eq!(handshake.phase(), ClientPhase::AwaitingInit);

        let init = ClientInit::new(PlayerId::new(3), 8);
        let step = handshake.on_event(TransportEvent::Received {
            peer: host,
            channel: Channel::CONTROL,
            payload: init_bytes(init),
        });
        assert_eq!(step, HandshakeStep::Assigned(init));
        assert_eq!(handshake.phase(), ClientPhase::Complete);
    }

    #[test]
    fn client_fails_on_disconnect_or_bad_init() {
        let host = PeerId::new(9);
        let mut handshake = ClientHandshake::new(host, Duration::from_secs(5));
        assert_eq!(
            handshake.on_event(TransportEvent::Disconnected { peer: host }),
            HandshakeStep::Failed(NetplayError::Disconnected)
        );

        let mut handshake = ClientHandshake::new(host, Duration::from_secs(5));
        let step = handshake.on_event(TransportEvent::Received {
            peer: host,
            channel: Channel::CONTROL,
            payload: vec![control_tag::START_GAME],
        });
        assert_eq!(
            step,
            HandshakeStep::Failed(NetplayError::HandshakeRejected {
                reason: HandshakeRejection::UnexpectedMessage
            })
        );
        assert_eq!(handshake.phase(), ClientPhase::Failed);
    }

    #[test]
    fn client_ignores_other_peers() {
        let mut handshake = ClientHandshake::new(PeerId::new(1), Duration::from_secs(5));
        let step = handshake.on_event(TransportEvent::Disconnected {
            peer: PeerId::new(2),
        });
        assert_eq!(step, HandshakeStep::Pending);
        assert_eq!(handshake.phase(), ClientPhase::AwaitingConnect);
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let mut handshake = ClientHandshake::new(PeerId::new(1), Duration::ZERO);
        assert_eq!(handshake.remaining(), None);
        assert_eq!(
            handshake.expire(),
            NetplayError::HandshakeTimeout { waited_ms: 0 }
        );
        assert_eq!(handshake.phase(), ClientPhase::Failed);
    }
}
