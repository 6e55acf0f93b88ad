//! Typed wire messages.
//!
//! Raw payloads are decoded exactly once, at the point they come off the
//! transport; everything past that works on these types.

use serde::{Deserialize, Serialize};

use crate::input_queue::InputFrame;
use crate::network::codec::{
    decode_exact, decode_tagged, encode, encode_tagged, CodecError, CodecResult,
};
use crate::sessions::player_registry::PlayerRecord;
use crate::{Frame, PlayerId, MAX_PLAYERS, NETPLAY_MAGIC, PROTOCOL_VERSION};

/// Tag bytes on the control channel.
pub mod control_tag {
    /// Host → joining client: slot assignment.
    pub const CLIENT_INIT: u8 = 0x01;
    /// Client → host: registration.
    pub const PLAYER_INFO: u8 = 0x02;
    /// Host → all: full roster.
    pub const PLAYER_LIST: u8 = 0x03;
    /// Host → all: start the game.
    pub const START_GAME: u8 = 0x04;
}

/// Tag bytes on the blob channel.
pub mod blob_tag {
    /// Opens a transfer.
    pub const BEGIN: u8 = 0x01;
    /// Carries part of a transfer.
    pub const CHUNK: u8 = 0x02;
    /// Closes a transfer.
    pub const END: u8 = 0x03;
    /// Tells observers to reload from what they received.
    pub const SYNC: u8 = 0x04;
    /// Releases observers into the running state.
    pub const GO_LIVE: u8 = 0x05;
    /// Observer → origin: reload finished.
    pub const READY: u8 = 0x06;
    /// Observer → origin: frame reached.
    pub const FRAME_ACK: u8 = 0x07;
}

/// Exact size of an encoded [`ClientInit`], tag included.
pub const CLIENT_INIT_LEN: usize = 11;

/// Slot assignment sent by the host to a connecting peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInit {
    /// Must equal [`NETPLAY_MAGIC`].
    pub magic: u32,
    /// Must equal [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Slot the peer will occupy.
    pub assigned_id: u8,
    /// Roster capacity.
    pub max_players: u8,
}

impl ClientInit {
    /// An init for this protocol version.
    #[must_use]
    pub const fn new(assigned_id: PlayerId, max_players: u8) -> Self {
        Self {
            magic: NETPLAY_MAGIC,
            version: PROTOCOL_VERSION,
            assigned_id: assigned_id.as_u8(),
            max_players,
        }
    }
}

/// A client's registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Must equal [`NETPLAY_MAGIC`].
    pub magic: u32,
    /// Must equal [`PROTOCOL_VERSION`].
    pub version: u32,
    /// The client's own record. Its id must be the assigned slot.
    pub player: PlayerRecord,
}

impl PlayerInfo {
    /// Registration for this protocol version.
    #[must_use]
    pub fn new(player: PlayerRecord) -> Self {
        Self {
            magic: NETPLAY_MAGIC,
            version: PROTOCOL_VERSION,
            player,
        }
    }
}

/// The host's roster broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerList {
    /// Occupied slots.
    pub count: u8,
    /// All sixteen slots in order.
    pub players: Vec<PlayerRecord>,
}

/// Control channel messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Slot assignment.
    ClientInit(ClientInit),
    /// Registration.
    PlayerInfo(PlayerInfo),
    /// Roster broadcast.
    PlayerList(PlayerList),
    /// Start the game.
    StartGame,
}

impl ControlMessage {
    /// Encodes the message with its tag.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        match self {
            Self::ClientInit(init) => encode_tagged(control_tag::CLIENT_INIT, init),
            Self::PlayerInfo(info) => encode_tagged(control_tag::PLAYER_INFO, info),
            Self::PlayerList(list) => encode_tagged(control_tag::PLAYER_LIST, list),
            Self::StartGame => Ok(vec![control_tag::START_GAME]),
        }
    }

    /// Decodes a control payload.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let (tag, body) = decode_tagged(bytes)?;
        match tag {
            control_tag::CLIENT_INIT => decode_exact(body).map(Self::ClientInit),
            control_tag::PLAYER_INFO => decode_exact(body).map(Self::PlayerInfo),
            control_tag::PLAYER_LIST => {
                let list: PlayerList = decode_exact(body)?;
                if list.count as usize > MAX_PLAYERS || list.players.len() != MAX_PLAYERS {
                    return Err(CodecError::decode(
                        format!(
                            "player list with count {} and {} entries",
                            list.count,
                            list.players.len()
                        ),
                        crate::network::codec::CodecOperation::DecodeMessage,
                    ));
                }
                Ok(Self::PlayerList(list))
            },
            control_tag::START_GAME if body.is_empty() => Ok(Self::StartGame),
            control_tag::START_GAME => Err(CodecError::TrailingBytes {
                consumed: 0,
                available: body.len(),
            }),
            tag => Err(CodecError::UnknownTag { tag }),
        }
    }
}

/// Header shared by Begin and End.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeader {
    /// Raw blob kind. Validated by the receiver.
    pub kind: u8,
    /// Declared size of the whole blob.
    pub total_length: u32,
}

/// Part of a blob.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobChunk {
    /// Raw blob kind. Must match the open transfer.
    pub kind: u8,
    /// Must match the open transfer.
    pub total_length: u32,
    /// Position of `bytes` in the blob.
    pub offset: u32,
    /// Chunk payload.
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for BlobChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            kind,
            total_length,
            offset,
            bytes,
        } = self;

        f.debug_struct("BlobChunk")
            .field("kind", kind)
            .field("total_length", total_length)
            .field("offset", offset)
            .field("len", &bytes.len())
            .finish()
    }
}

/// Blob channel messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobMessage {
    /// Opens a transfer.
    Begin(BlobHeader),
    /// Carries part of a transfer.
    Chunk(BlobChunk),
    /// Closes a transfer.
    End(BlobHeader),
    /// Reset and reload from the received blobs.
    Sync {
        /// Console model to select before reloading.
        console_type: u8,
    },
    /// Start running.
    GoLive,
    /// Reload finished.
    Ready,
    /// The observer reached `frame`.
    FrameAck {
        /// Observer's current frame.
        frame: Frame,
    },
}

impl BlobMessage {
    /// Encodes the message with its tag.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        match self {
            Self::Begin(header) => encode_tagged(blob_tag::BEGIN, header),
            Self::Chunk(chunk) => encode_tagged(blob_tag::CHUNK, chunk),
            Self::End(header) => encode_tagged(blob_tag::END, header),
            Self::Sync { console_type } => encode_tagged(blob_tag::SYNC, console_type),
            Self::GoLive => Ok(vec![blob_tag::GO_LIVE]),
            Self::Ready => Ok(vec![blob_tag::READY]),
            Self::FrameAck { frame } => encode_tagged(blob_tag::FRAME_ACK, frame),
        }
    }

    /// Decodes a blob channel payload.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let (tag, body) = decode_tagged(bytes)?;
        let unit = |message: Self| {
            if body.is_empty() {
                Ok(message)
            } else {
                Err(CodecError::TrailingBytes {
                    consumed: 0,
                    available: body.len(),
                })
            }
        };
        match tag {
            blob_tag::BEGIN => decode_exact(body).map(Self::Begin),
            blob_tag::CHUNK => decode_exact(body).map(Self::Chunk),
            blob_tag::END => decode_exact(body).map(Self::End),
            blob_tag::SYNC => decode_exact(body).map(|console_type| Self::Sync { console_type }),
            blob_tag::GO_LIVE => unit(Self::GoLive),
            blob_tag::READY => unit(Self::Ready),
            blob_tag::FRAME_ACK => decode_exact(body).map(|frame| Self::FrameAck { frame }),
            tag => Err(CodecError::UnknownTag { tag }),
        }
    }
}

/// One frame of input on a player's input channel. Untagged: the channel says what it is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InputMessage {
    /// The input.
    pub frame: InputFrame,
}

impl InputMessage {
    /// Encodes the input frame.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode(&self.frame)
    }

    /// Decodes an input payload.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        decode_exact(bytes).map(|frame| Self { frame })
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
    use crate::sessions::player_registry::{PlayerName, PlayerStatus};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn client_init_is_eleven_bytes() {
        let bytes = ControlMessage::ClientInit(ClientInit::new(PlayerId::new(3), 8))
            .encode()
            .unwrap();
        assert_eq!(bytes.len(), CLIENT_INIT_LEN);
        assert_eq!(bytes[0], control_tag::CLIENT_INIT);
        assert_eq!(&bytes[1..5], b"NETP");
        assert_eq!(&bytes[5..9], &[1, 0, 0, 0]);
        assert_eq!(bytes[9], 3);
        assert_eq!(bytes[10], 8);
    }

    #[test]
    fn player_info_survives_the_wire() {
        let record = PlayerRecord {
            id: PlayerId::new(2),
            name: PlayerName::new("Lorenzo"),
            status: PlayerStatus::Client,
            address: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            is_local: true,
        };
        let message = ControlMessage::PlayerInfo(PlayerInfo::new(record.clone()));
        let decoded = ControlMessage::decode(&message.encode().unwrap()).unwrap();

        let ControlMessage::PlayerInfo(info) = decoded else {
            panic!("wrong message kind");
        };
        assert_eq!(info.player.id, record.id);
        assert_eq!(info.player.name, record.name);
        assert!(!info.player.is_local, "is_local must not travel");
    }

    #[test]
    fn oversized_player_list_is_rejected() {
        let list = PlayerList {
            count: 17,
            players: (0..16)
                .map(|i| PlayerRecord::empty(PlayerId::new(i)))
                .collect(),
        };
        let bytes = ControlMessage::PlayerList(list).encode().unwrap();
        assert!(ControlMessage::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_tags_are_errors() {
        assert_eq!(
            ControlMessage::decode(&[0x09]),
            Err(CodecError::UnknownTag { tag: 0x09 })
        );
        assert_eq!(
            BlobMessage::decode(&[0x00]),
            Err(CodecError::UnknownTag { tag: 0x00 })
        );
    }

    #[test]
    fn unit_messages_reject_trailing_bytes() {
        assert_eq!(ControlMessage::decode(&[0x04]), Ok(ControlMessage::StartGame));
        assert!(ControlMessage::decode(&[0x04, 0]).is_err());
        assert_eq!(BlobMessage::decode(&[0x05]), Ok(BlobMessage::GoLive));
        assert!(BlobMessage::decode(&[0x06, 1]).is_err());
    }

    #[test]
    fn begin_header_layout() {
        let bytes = BlobMessage::Begin(BlobHeader {
            kind: 1,
            total_length: 0x0102_0304,
        })
        .encode()
        .unwrap();
        assert_eq!(bytes, [blob_tag::BEGIN, 1, 4, 3, 2, 1]);
    }

    #[test]
    fn chunk_debug_hides_payload() {
        let chunk = BlobChunk {
            kind: 0,
            total_length: 4,
            offset: 0,
            bytes: vec![0xAB; 4],
        };
        let text = format!("{chunk:?}");
        assert!(text.contains("len: 4"));
        assert!(!text.contains("171"));
    }

    #[test]
    fn truncated_chunk_fails_to_decode() {
        let bytes = BlobMessage::Chunk(BlobChunk {
            kind: 0,
            total_length: 10,
            offset: 0,
            bytes: vec![1, 2, 3],
        })
        .encode()
        .unwrap();
        assert!(BlobMessage::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
