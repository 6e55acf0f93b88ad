//! Wire layout:
//!
//! ```text
//! +-----+------------------------------------------+
//! | tag | body (bincode, fixed-int, little-endian) |
//! +-----+------------------------------------------+
//! ```
//!
//! The tag names the message kind within its channel. A body must be consumed
//! exactly; trailing bytes are a decode error.
//!
//! ```
//! use lockstep_netplay::network::codec::{decode_tagged, encode_tagged};
//!
//! let bytes = encode_tagged(4, &0x1234_u32).unwrap();
//! assert_eq!(bytes, [4, 0x34, 0x12, 0, 0]);
//!
//! let (tag, body) = decode_tagged(&bytes).unwrap();
//! assert_eq!(tag, 4);
//! assert_eq!(body, &[0x34, 0x12, 0, 0]);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a tagged wire message.
    EncodeMessage,
    /// Decoding a tagged wire message.
    DecodeMessage,
    /// Appending to a buffer.
    AppendToBuffer,
    /// A bare encode.
    Encode,
    /// A bare decode.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding network message"),
            Self::DecodeMessage => write!(f, "decoding network message"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors from encoding or decoding.
///
/// bincode errors are opaque, so their text is kept as a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Encoding failed.
    EncodeError {
        /// bincode's message.
        message: String,
        /// What was being done.
        operation: CodecOperation,
    },
    /// Decoding failed.
    DecodeError {
        /// bincode's message.
        message: String,
        /// What was being done.
        operation: CodecOperation,
    },
    /// A payload had no tag byte.
    EmptyPayload,
    /// The tag byte does not name a known message on this channel.
    UnknownTag {
        /// The tag that was read.
        tag: u8,
    },
    /// The body decoded without using every byte.
    TrailingBytes {
        /// Bytes the body used.
        consumed: usize,
        /// Bytes available.
        available: usize,
    },
}

impl CodecError {
    /// Creates an encode error.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::EmptyPayload => write!(f, "empty payload, no message tag"),
            Self::UnknownTag { tag } => write!(f, "unknown message tag {tag:#04x}"),
            Self::TrailingBytes {
                consumed,
                available,
            } => {
                write!(
                    f,
                    "message body used {consumed} of {available} bytes"
                )
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to `buffer`. Returns the number of bytes written.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value and returns it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value that must occupy all of `bytes`.
pub fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let (value, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            available: bytes.len(),
        });
    }
    Ok(value)
}

/// Encodes `tag` followed by `body`.
pub fn encode_tagged<T: Serialize>(tag: u8, body: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = vec![tag];
    encode_append(body, &mut buffer).map_err(|e| match e {
        CodecError::EncodeError { message, .. } => {
            CodecError::encode(message, CodecOperation::EncodeMessage)
        },
        other => other,
    })?;
    Ok(buffer)
}

/// Splits a payload into its tag and body.
pub fn decode_tagged(bytes: &[u8]) -> CodecResult<(u8, &[u8])> {
    bytes
        .split_first()
        .map(|(tag, body)| (*tag, body))
        .ok_or(CodecError::EmptyPayload)
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
    fn integers_are_fixed_width_little_endian() {
        let bytes = encode(&0x5054_454E_u32).unwrap();
        assert_eq!(bytes, b"NETP");
        let bytes = encode(&1_u8).unwrap();
        assert_eq!(bytes, [1]);
    }

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let result: CodecResult<u16> = decode_exact(&[1, 2, 3]);
        assert_eq!(
            result,
            Err(CodecError::TrailingBytes {
                consumed: 2,
                available: 3
            })
        );
    }

    #[test]
    fn decode_exact_rejects_short_input() {
        let result: CodecResult<u32> = decode_exact(&[1, 2]);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    #[test]
    fn empty_payload_has_no_tag() {
        assert_eq!(decode_tagged(&[]), Err(CodecError::EmptyPayload));
    }

    #[test]
    fn tag_only_payload_has_empty_body() {
        let bytes = encode_tagged(5, &()).unwrap();
        assert_eq!(bytes, [5]);
        let (tag, body) = decode_tagged(&bytes).unwrap();
        assert_eq!(tag, 5);
        assert!(body.is_empty());
    }

    #[test]
    fn encode_append_reports_written_length() {
        let mut buffer = vec![0xAA];
        let written = encode_append(&7_u32, &mut buffer).unwrap();
        assert_eq!(written, 4);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn error_display_names_the_operation() {
        let err = CodecError::decode("unexpected end", CodecOperation::DecodeMessage);
        assert!(err.to_string().contains("decoding network message"));
        assert!(CodecError::UnknownTag { tag: 9 }.to_string().contains("0x09"));
    }
}
