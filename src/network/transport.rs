//! The transport a session runs over.
//!
//! A transport is an endpoint that can accept several peers and connect out
//! to others (ENet-style). Per channel it delivers reliable messages in order;
//! unreliable messages may be lost but are never corrupted.
//!
//! Channel layout:
//!
//! | Channel | Use |
//! |---|---|
//! | `0..16` | per-player input, channel = sender's player id (unreliable) |
//! | `16` | control: handshake, roster, start (reliable) |
//! | `17` | blob replication (reliable) |

use std::net::SocketAddr;

use smallvec::SmallVec;
use web_time::Duration;

use crate::{PlayerId, MAX_PLAYERS};

/// Every transport is created with this many channels.
pub const CHANNEL_COUNT: usize = MAX_PLAYERS + 2;

/// Peer lists are nearly always short.
pub type PeerVec = SmallVec<[PeerId; 4]>;

/// Transport-local handle for a connected peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// Wraps a raw handle.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// A logical channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    /// Handshake, roster and start messages.
    pub const CONTROL: Self = Self(MAX_PLAYERS as u8);
    /// Blob replication.
    pub const BLOB: Self = Self(MAX_PLAYERS as u8 + 1);

    /// Wraps a raw channel number.
    #[must_use]
    pub const fn new(channel: u8) -> Self {
        Self(channel)
    }

    /// Input channel of a player.
    #[must_use]
    pub const fn input(player: PlayerId) -> Self {
        Self(player.as_u8())
    }

    /// The sending player, if this is an input channel.
    #[must_use]
    pub fn input_player(self) -> Option<PlayerId> {
        PlayerId::from_index(self.0 as usize)
    }

    /// Returns the raw channel number.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the channel as an index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::CONTROL => write!(f, "control"),
            Self::BLOB => write!(f, "blob"),
            Self(n) => write!(f, "input{}", n),
        }
    }
}

/// Delivery guarantee for one message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Retransmitted until acknowledged, ordered within the channel.
    Reliable,
    /// Sent once. A lost message is superseded by the next one.
    Unreliable,
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was established, inbound or outbound.
    Connected {
        /// Handle of the new peer.
        peer: PeerId,
        /// The peer's transport address.
        addr: SocketAddr,
    },
    /// A peer went away.
    Disconnected {
        /// Handle of the lost peer. It is invalid from now on.
        peer: PeerId,
    },
    /// A message arrived.
    Received {
        /// Sender.
        peer: PeerId,
        /// Channel it arrived on.
        channel: Channel,
        /// Raw message bytes.
        payload: Vec<u8>,
    },
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint could not be created.
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Reason reported by the transport.
        reason: String,
    },
    /// An outbound connection could not be started.
    Connect {
        /// Target address.
        addr: SocketAddr,
        /// Reason reported by the transport.
        reason: String,
    },
    /// The peer handle is not connected.
    UnknownPeer {
        /// The stale handle.
        peer: PeerId,
    },
    /// The channel does not exist on this endpoint.
    ChannelOutOfRange {
        /// Requested channel.
        channel: Channel,
        /// Channels the endpoint was created with.
        channel_count: usize,
    },
    /// The endpoint has been shut down.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind { addr, reason } => write!(f, "failed to bind {}: {}", addr, reason),
            Self::Connect { addr, reason } => {
                write!(f, "failed to connect to {}: {}", addr, reason)
            },
            Self::UnknownPeer { peer } => write!(f, "{} is not connected", peer),
            Self::ChannelOutOfRange {
                channel,
                channel_count,
            } => write!(
                f,
                "channel {} out of range for {} channels",
                channel.as_u8(),
                channel_count
            ),
            Self::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One transport endpoint.
///
/// Sessions call [`poll`](Transport::poll) with a zero timeout on every
/// simulation tick, so `poll` must return promptly when nothing is queued.
pub trait Transport: Send {
    /// The address this endpoint is reachable at.
    fn local_addr(&self) -> SocketAddr;

    /// Starts a connection. Completion is reported as [`TransportEvent::Connected`].
    fn connect(&mut self, addr: SocketAddr) -> Result<PeerId, TransportError>;

    /// Closes a connection. The remote side sees [`TransportEvent::Disconnected`].
    fn disconnect(&mut self, peer: PeerId);

    /// Waits up to `timeout` for the next event.
    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent>;

    /// Sends to one peer.
    fn send(
        &mut self,
        peer: PeerId,
        channel: Channel,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<(), TransportError>;

    /// Sends to every connected peer.
    fn broadcast(
        &mut self,
        channel: Channel,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<(), TransportError>;

    /// Remote address of a connected peer.
    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr>;

    /// Every connected peer.
    fn peers(&self) -> PeerVec;
}

/// Creates transport endpoints.
pub trait TransportFactory: Send {
    /// Creates an endpoint bound to `bind` that accepts up to `max_peers` peers.
    ///
    /// An unspecified IP in `bind` means "this machine".
    fn create_host(
        &self,
        bind: SocketAddr,
        max_peers: usize,
        channel_count: usize,
    ) -> Result<Box<dyn Transport>, TransportError>;
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
    fn reserved_channels_follow_input_channels() {
        assert_eq!(Channel::CONTROL.as_usize(), 16);
        assert_eq!(Channel::BLOB.as_usize(), 17);
        assert_eq!(CHANNEL_COUNT, 18);
    }

    #[test]
    fn input_channel_round_trips_player() {
        let player = PlayerId::new(5);
        assert_eq!(Channel::input(player).input_player(), Some(player));
        assert_eq!(Channel::CONTROL.input_player(), None);
        assert_eq!(Channel::BLOB.input_player(), None);
    }

    #[test]
    fn channel_display_names_reserved_channels() {
        assert_eq!(Channel::CONTROL.to_string(), "control");
        assert_eq!(Channel::new(3).to_string(), "input3");
    }
}
