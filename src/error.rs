use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::network::transport::TransportError;

/// Why a join handshake was refused.
///
/// These are always reported before any roster state is touched, so a rejected
/// join leaves nothing behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeRejection {
    /// The peer does not speak this protocol at all.
    WrongMagic {
        /// Magic value that was received.
        received: u32,
    },
    /// The peer speaks a different protocol version. Versions are never negotiated.
    VersionMismatch {
        /// Version that was received.
        received: u32,
    },
    /// A handshake message had the wrong size.
    MalformedLength {
        /// Expected payload size in bytes.
        expected: usize,
        /// Actual payload size in bytes.
        actual: usize,
    },
    /// The host assigned a slot outside `0..16`.
    AssignedIdOutOfRange {
        /// The assigned slot.
        id: u8,
    },
    /// The host announced a roster capacity outside `1..=16`.
    MaxPlayersOutOfRange {
        /// The announced capacity.
        max_players: u8,
    },
    /// Something other than the init message arrived first, or on the wrong channel.
    UnexpectedMessage,
}

impl Display for HandshakeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongMagic { received } => {
                write!(f, "wrong protocol magic {:#010x}", received)
            },
            Self::VersionMismatch { received } => {
                write!(
                    f,
                    "protocol version mismatch: peer speaks {}, we speak {}",
                    received,
                    crate::PROTOCOL_VERSION
                )
            },
            Self::MalformedLength { expected, actual } => {
                write!(
                    f,
                    "malformed handshake message: expected {} bytes, got {}",
                    expected, actual
                )
            },
            Self::AssignedIdOutOfRange { id } => {
                write!(f, "assigned player id {} is out of range", id)
            },
            Self::MaxPlayersOutOfRange { max_players } => {
                write!(f, "announced max players {} is out of range", max_players)
            },
            Self::UnexpectedMessage => write!(f, "unexpected message during handshake"),
        }
    }
}

/// This enum contains every error the session layer can return.
///
/// Join failures ([`Transport`], [`HandshakeTimeout`], [`HandshakeRejected`],
/// [`Disconnected`]) abort the attempt and leave the session inactive.
///
/// [`Transport`]: NetplayError::Transport
/// [`HandshakeTimeout`]: NetplayError::HandshakeTimeout
/// [`HandshakeRejected`]: NetplayError::HandshakeRejected
/// [`Disconnected`]: NetplayError::Disconnected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetplayError {
    /// The transport failed to bind, connect or send.
    Transport(TransportError),
    /// The host did not complete the handshake in time.
    HandshakeTimeout {
        /// How long the attempt waited, in milliseconds.
        waited_ms: u64,
    },
    /// The handshake was refused.
    HandshakeRejected {
        /// The specific incompatibility.
        reason: HandshakeRejection,
    },
    /// The remote side closed the connection during the attempt.
    Disconnected,
    /// The operation is reserved for the host.
    NotHost,
    /// No session is active.
    SessionNotActive,
    /// A session is already active on this context.
    SessionAlreadyActive,
    /// The game has already started.
    GameAlreadyRunning,
    /// The request itself was invalid.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A configuration value was out of range.
    InvalidConfig {
        /// Which field was wrong and how.
        info: String,
    },
    /// A message could not be encoded or decoded.
    Codec(CodecError),
    /// Replication did not finish before its deadline.
    ReplicationTimeout {
        /// How long the origin or observer waited, in milliseconds.
        waited_ms: u64,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "Transport error: {}", err),
            Self::HandshakeTimeout { waited_ms } => {
                write!(f, "Handshake timed out after {} ms", waited_ms)
            },
            Self::HandshakeRejected { reason } => write!(f, "Handshake rejected: {}", reason),
            Self::Disconnected => write!(f, "The remote peer disconnected"),
            Self::NotHost => write!(f, "Only the host can do this"),
            Self::SessionNotActive => write!(f, "No netplay session is active"),
            Self::SessionAlreadyActive => write!(f, "A netplay session is already active"),
            Self::GameAlreadyRunning => write!(f, "The game is already running"),
            Self::InvalidRequest { info } => write!(f, "Invalid Request: {}", info),
            Self::InvalidConfig { info } => write!(f, "Invalid configuration: {}", info),
            Self::Codec(err) => write!(f, "Codec error: {}", err),
            Self::ReplicationTimeout { waited_ms } => {
                write!(f, "Replication timed out after {} ms", waited_ms)
            },
        }
    }
}

impl Error for NetplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for NetplayError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<HandshakeRejection> for NetplayError {
    fn from(reason: HandshakeRejection) -> Self {
        Self::HandshakeRejected { reason }
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

    #[test]
    fn rejection_converts_into_error() {
        let err: NetplayError = HandshakeRejection::VersionMismatch { received: 7 }.into();
        assert_eq!(
            err,
            NetplayError::HandshakeRejected {
                reason: HandshakeRejection::VersionMismatch { received: 7 }
            }
        );
        assert!(err.to_string().contains("peer speaks 7"));
    }

    #[test]
    fn wrong_magic_is_printed_in_hex() {
        let msg = HandshakeRejection::WrongMagic {
            received: 0xDEAD_BEEF,
        }
        .to_string();
        assert!(msg.contains("0xdeadbeef"), "{msg}");
    }

    #[test]
    fn transport_error_is_the_source() {
        let err = NetplayError::from(TransportError::Closed);
        assert!(err.source().is_some());
        assert!(NetplayError::NotHost.source().is_none());
    }
}
