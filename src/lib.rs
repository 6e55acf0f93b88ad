//! # Lockstep Netplay
//!
//! Host-authoritative peer-group sessions for deterministic simulations.
//!
//! One participant hosts, up to fifteen others join. The crate takes care of:
//! - the join handshake (magic + protocol version check, slot assignment)
//! - a shared roster that the host owns and re-broadcasts on every change
//! - a start barrier that maps roster slots onto local simulation instances
//! - delayed input distribution so every participant applies the same input on the same frame
//! - chunked replication of cart, save and state images to late observers
//!
//! The transport and the simulation are collaborators supplied by the application through
//! the [`Transport`] / [`TransportFactory`] and [`Simulation`] traits. An in-process
//! [`MemoryNetwork`] is bundled for tests and local demos.
//!
//! ```
//! use lockstep_netplay::{MemoryNetwork, SessionBuilder};
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! let network = MemoryNetwork::new();
//! let mut host = SessionBuilder::new()
//!     .with_transport_factory(network.factory(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))))
//!     .build()
//!     .unwrap();
//! host.start_as_host("Host", 8064).unwrap();
//! assert_eq!(host.player_list().len(), 1);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use serde::{Deserialize, Serialize};

pub use error::{HandshakeRejection, NetplayError};
pub use input_queue::{ConsumeOutcome, InputFrame, InputQueue, LocalInput, Touch};
pub use network::codec::{CodecError, CodecOperation};
pub use network::memory_transport::{MemoryNetwork, MemoryTransport, MemoryTransportFactory};
pub use network::messages::{BlobMessage, ControlMessage, InputMessage};
pub use network::transport::{
    Channel, Delivery, PeerId, PeerVec, Transport, TransportError, TransportEvent,
    TransportFactory, CHANNEL_COUNT,
};
pub use replication::observer::{ObserverPhase, ReplicationObserver};
pub use replication::origin::{Backpressure, ReplicationOrigin, SyncReport};
pub use replication::receiver::{BlobKind, BlobReceiver, BlobRejection, ReceiveOutcome};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ReplicationConfig, SessionConfig};
pub use sessions::event_drain::EventDrain;
pub use sessions::game_start::InstanceMap;
pub use sessions::handshake::{ClientHandshake, HandshakeStep, HostHandshake, RejectReason};
pub use sessions::netplay_session::{NetplaySession, ProcessOutcome};
pub use sessions::player_registry::{PlayerName, PlayerRecord, PlayerRegistry, PlayerStatus};
pub use sessions::session_health::SessionHealth;

/// Error types returned by sessions and replication.
pub mod error;
pub mod input_queue;
pub mod telemetry;
/// Wire messages, their codec, and the transport they travel over.
pub mod network {
    /// Binary codec for wire messages.
    ///
    /// Every message is one tag byte followed by a fixed-int little-endian bincode body.
    pub mod codec;
    pub mod memory_transport;
    pub mod messages;
    pub mod transport;
}
/// Lobby, handshake, game start and lockstep for a peer group.
pub mod sessions {
    /// [`SessionBuilder`](crate::SessionBuilder) for configuring a [`NetplaySession`](crate::NetplaySession).
    pub mod builder;
    pub mod config;
    /// Draining iterator over queued session events.
    pub mod event_drain;
    pub mod game_start;
    pub mod handshake;
    /// The session context: hosting, joining, starting and per-tick processing.
    pub mod netplay_session;
    pub mod player_registry;
    pub mod session_health;
}
/// Chunked transfer of cart, save and state images from an origin to observers.
pub mod replication {
    pub mod observer;
    pub mod origin;
    pub mod receiver;
}

// #############
// # CONSTANTS #
// #############

/// Hard upper bound on participants in one session, host included.
pub const MAX_PLAYERS: usize = 16;

/// Protocol magic, `"NETP"` read as a little-endian `u32`.
pub const NETPLAY_MAGIC: u32 = 0x5054_454E;

/// Wire protocol version. Peers with a different version are always rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default number of frames between capturing an input and applying it.
pub const DEFAULT_LAG_DEPTH: usize = 4;

/// Key mask with every button released. Buttons are active-low.
pub const NEUTRAL_KEY_MASK: u32 = 0xFFF;

/// Internally, -1 represents no frame.
pub const NULL_FRAME: i32 = -1;

/// A simulation frame number.
///
/// Frames start at 0 and increase by one per simulation tick. [`Frame::NULL`]
/// marks "no frame yet", e.g. a queue that has not consumed anything.
///
/// ```
/// use lockstep_netplay::Frame;
///
/// let frame = Frame::new(10);
/// assert_eq!((frame + 4).as_i32(), 14);
/// assert!(Frame::NULL.is_null());
/// assert!(frame > Frame::NULL);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Frame(i32);

impl Frame {
    /// No frame.
    pub const NULL: Self = Self(NULL_FRAME);

    /// The first frame of a session.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw frame number without validation.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the raw frame number.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` for non-negative frames.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Offsets the frame by a lag depth, saturating at `i32::MAX`.
    #[inline]
    #[must_use]
    pub fn delayed_by(self, lag_depth: usize) -> Self {
        let lag = i32::try_from(lag_depth).unwrap_or(i32::MAX);
        Self(self.0.saturating_add(lag))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// A roster slot, `0..16`. Slot 0 belongs to the host.
///
/// The id is the index into the roster and also the input channel the player
/// broadcasts on.
///
/// ```
/// use lockstep_netplay::PlayerId;
///
/// assert_eq!(PlayerId::HOST.as_usize(), 0);
/// assert!(PlayerId::new(15).is_valid());
/// assert!(!PlayerId::new(16).is_valid());
/// assert_eq!(PlayerId::from_index(3), Some(PlayerId::new(3)));
/// assert_eq!(PlayerId::from_index(16), None);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(u8);

impl PlayerId {
    /// The host's slot.
    pub const HOST: Self = Self(0);

    /// Wraps a raw slot number without validation.
    #[inline]
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Converts a roster index into an id, `None` when out of range.
    #[inline]
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        if index < MAX_PLAYERS {
            u8::try_from(index).ok().map(Self)
        } else {
            None
        }
    }

    /// Returns the raw slot number.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the slot as a roster index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` if the id addresses a roster slot.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_PLAYERS
    }

    /// Iterates every slot in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..MAX_PLAYERS as u8).map(Self)
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session context owned by a [`NetplaySession`].
///
/// `instances` is empty until the game starts. After that it is fixed for
/// the rest of the session and instance 0 is always the local player.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    /// A session is hosted or joined.
    pub active: bool,
    /// This side is the host.
    pub is_host: bool,
    /// The game has been started.
    pub running: bool,
    /// The local participant's record.
    pub my_player: PlayerRecord,
    /// Address of the host, as seen from this side.
    pub host_address: Option<std::net::SocketAddr>,
    /// Roster capacity agreed during the handshake.
    pub max_players: u8,
    /// Session port. Clients listen on it for mesh connections.
    pub port: u16,
    /// Instance/player mapping assigned at game start.
    pub instances: InstanceMap,
}

/// Notifications queued by a session, drained with [`NetplaySession::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetplayEvent {
    /// A peer completed its handshake and now occupies `player`.
    PlayerJoined {
        /// Slot of the new player.
        player: PlayerId,
        /// Name the player registered with.
        name: PlayerName,
    },
    /// A player's connection was closed and its slot freed.
    PlayerLeft {
        /// Slot that was freed.
        player: PlayerId,
    },
    /// The roster was replaced by a host broadcast.
    RosterUpdated {
        /// Occupied slots after the update.
        players: usize,
    },
    /// The host turned away an incoming connection.
    ConnectionRejected {
        /// Transport address of the rejected peer.
        addr: std::net::SocketAddr,
        /// Why the connection was refused.
        reason: RejectReason,
    },
    /// Local start finished; the instance mapping is fixed.
    GameStarted {
        /// The local player's slot (instance 0).
        local_player: PlayerId,
        /// Number of simulation instances in use.
        instances: usize,
    },
    /// A player's input queue ran dry. The simulation must not advance.
    InputStarved {
        /// Player whose queue is empty.
        player: PlayerId,
        /// Frame that could not be served.
        frame: Frame,
    },
    /// Queued frames older than the simulation were discarded.
    FramesDropped {
        /// Player whose queue fell behind.
        player: PlayerId,
        /// Number of discarded frames.
        dropped: usize,
        /// Frame the queue caught up to.
        frame: Frame,
    },
    /// The connection to the host was lost and the session ended.
    HostLost,
}

/// The deterministic simulation being kept in lockstep.
///
/// Instances are numbered from 0; instance 0 is always the local player.
/// Replication drives instance 0 only.
pub trait Simulation {
    /// Frame the given instance is about to run.
    fn current_frame(&self, instance: usize) -> Frame;

    /// Applies one frame of input to an instance.
    fn apply_input(&mut self, instance: usize, key_mask: u32, touch: Option<Touch>);

    /// Hard reset of the primary instance.
    fn reset(&mut self);

    /// Loads a cart image, optionally with its save image. Returns `false` on failure.
    fn load_cartridge(&mut self, image: &[u8], save: Option<&[u8]>) -> bool;

    /// Snapshot of the primary instance.
    fn serialize_state(&self) -> Vec<u8>;

    /// Restores a snapshot into the primary instance. Returns `false` on failure.
    fn deserialize_state(&mut self, state: &[u8]) -> bool;

    /// Selects the console model before a reload.
    fn set_console_type(&mut self, console_type: u8);
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

    #[test]
    fn frame_null_displays_as_marker() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(7).to_string(), "7");
    }

    #[test]
    fn frame_delay_saturates() {
        assert_eq!(Frame::new(3).delayed_by(4), Frame::new(7));
        assert_eq!(Frame::new(i32::MAX - 1).delayed_by(4), Frame::new(i32::MAX));
    }

    #[test]
    fn frame_subtraction_gives_distance() {
        assert_eq!(Frame::new(20) - Frame::new(4), 16);
        assert_eq!(Frame::new(20) - 4, Frame::new(16));
    }

    #[test]
    fn player_ids_cover_every_slot() {
        let ids: Vec<_> = PlayerId::all().collect();
        assert_eq!(ids.len(), MAX_PLAYERS);
        assert_eq!(ids[0], PlayerId::HOST);
        assert!(ids.iter().all(|id| id.is_valid()));
    }

    #[test]
    fn magic_spells_netp() {
        assert_eq!(&NETPLAY_MAGIC.to_le_bytes(), b"NETP");
    }
}
