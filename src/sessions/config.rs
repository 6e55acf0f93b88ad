//! Session and replication configuration.
//!
//! Both structs are plain values with a [`Default`], a few named presets, and a
//! `validate()` that [`SessionBuilder::build`](crate::SessionBuilder::build) calls.
//!
//! ```
//! use lockstep_netplay::{ReplicationConfig, SessionConfig};
//! use web_time::Duration;
//!
//! let config = SessionConfig {
//!     max_players: 4,
//!     lag_depth: 6,
//!     ..SessionConfig::default()
//! };
//! assert!(config.validate().is_ok());
//!
//! let replication = ReplicationConfig {
//!     sync_timeout: Duration::from_secs(30),
//!     ..ReplicationConfig::lan()
//! };
//! assert!(replication.validate().is_ok());
//! ```

use web_time::Duration;

use crate::network::transport::CHANNEL_COUNT;
use crate::{NetplayError, DEFAULT_LAG_DEPTH, MAX_PLAYERS};

/// Largest lag depth a session accepts.
pub const MAX_LAG_DEPTH: usize = 64;

/// Largest chunk payload a replication origin may send or an observer accepts.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

/// Default chunk payload: a 64 KiB packet minus the chunk header.
pub const DEFAULT_CHUNK_SIZE: usize = 0x1_0000 - 16;

/// Default cap on a single blob's declared length.
pub const DEFAULT_MAX_BLOB_LENGTH: u32 = 0x4000_0000;

fn out_of_range(field: &str, min: u128, max: u128, actual: u128) -> NetplayError {
    NetplayError::InvalidConfig {
        info: format!("{field} must be between {min} and {max}, got {actual}"),
    }
}

/// Lobby and lockstep settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SessionConfig has no effect unless passed to SessionBuilder::with_session_config()"]
pub struct SessionConfig {
    /// Roster capacity, host included.
    ///
    /// Default: 16
    pub max_players: u8,

    /// Frames between capturing an input and applying it.
    ///
    /// Higher values hide more latency at the cost of input delay.
    ///
    /// Default: 4
    pub lag_depth: usize,

    /// How long a joining client waits for the connection and for the host's init.
    ///
    /// Default: 5000ms
    pub handshake_timeout: Duration,

    /// Channels every endpoint is created with. Must cover input, control and blob channels.
    ///
    /// Default: 18
    pub channel_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS as u8,
            lag_depth: DEFAULT_LAG_DEPTH,
            handshake_timeout: Duration::from_millis(5000),
            channel_count: CHANNEL_COUNT,
        }
    }
}

impl SessionConfig {
    /// Creates a `SessionConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Local network play: short input delay, quick join failure.
    pub fn lan() -> Self {
        Self {
            lag_depth: 2,
            handshake_timeout: Duration::from_millis(2000),
            ..Self::default()
        }
    }

    /// Long-distance play: more input delay and a patient handshake.
    pub fn high_latency() -> Self {
        Self {
            lag_depth: 8,
            handshake_timeout: Duration::from_millis(10000),
            ..Self::default()
        }
    }

    /// Checks every field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.max_players < 1 || self.max_players as usize > MAX_PLAYERS {
            return Err(out_of_range(
                "max_players",
                1,
                MAX_PLAYERS as u128,
                self.max_players as u128,
            ));
        }
        if self.lag_depth < 1 || self.lag_depth > MAX_LAG_DEPTH {
            return Err(out_of_range(
                "lag_depth",
                1,
                MAX_LAG_DEPTH as u128,
                self.lag_depth as u128,
            ));
        }
        if self.handshake_timeout < Duration::from_millis(1)
            || self.handshake_timeout > Duration::from_secs(300)
        {
            return Err(out_of_range(
                "handshake_timeout (ms)",
                1,
                300_000,
                self.handshake_timeout.as_millis(),
            ));
        }
        if self.channel_count < CHANNEL_COUNT || self.channel_count > u8::MAX as usize {
            return Err(out_of_range(
                "channel_count",
                CHANNEL_COUNT as u128,
                u8::MAX as u128,
                self.channel_count as u128,
            ));
        }
        Ok(())
    }
}

/// Blob replication settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ReplicationConfig has no effect unless passed to ReplicationOrigin or ReplicationObserver"]
pub struct ReplicationConfig {
    /// Payload bytes per chunk. Observers drop larger chunks.
    ///
    /// Default: 65520
    pub chunk_size: usize,

    /// How long the origin waits for every observer's Ready.
    ///
    /// Default: 300s
    pub sync_timeout: Duration,

    /// How long an observer waits for the origin's connection.
    ///
    /// Default: 5000ms
    pub connect_timeout: Duration,

    /// Frames an observer may fall behind before the origin pauses.
    ///
    /// Default: 16
    pub max_observer_lag: i32,

    /// Largest blob an observer accepts.
    ///
    /// Default: 0x4000_0000 (1 GiB)
    pub max_blob_length: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_millis(5000),
            max_observer_lag: 16,
            max_blob_length: DEFAULT_MAX_BLOB_LENGTH,
        }
    }
}

impl ReplicationConfig {
    /// Creates a `ReplicationConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast links: bigger chunks, shorter sync wait.
    pub fn lan() -> Self {
        Self {
            chunk_size: 4 * DEFAULT_CHUNK_SIZE,
            sync_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Slow or memory-constrained observers: small chunks, a tighter blob cap,
    /// more lag tolerance.
    pub fn constrained() -> Self {
        Self {
            chunk_size: 0x4000,
            max_observer_lag: 32,
            max_blob_length: 0x0400_0000,
            ..Self::default()
        }
    }

    /// Checks every field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.chunk_size < 1 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(out_of_range(
                "chunk_size",
                1,
                MAX_CHUNK_SIZE as u128,
                self.chunk_size as u128,
            ));
        }
        if self.sync_timeout < Duration::from_millis(1)
            || self.sync_timeout > Duration::from_secs(3600)
        {
            return Err(out_of_range(
                "sync_timeout (ms)",
                1,
                3_600_000,
                self.sync_timeout.as_millis(),
            ));
        }
        if self.connect_timeout < Duration::from_millis(1)
            || self.connect_timeout > Duration::from_secs(300)
        {
            return Err(out_of_range(
                "connect_timeout (ms)",
                1,
                300_000,
                self.connect_timeout.as_millis(),
            ));
        }
        if self.max_observer_lag < 1 || self.max_observer_lag > 3600 {
            return Err(out_of_range(
                "max_observer_lag",
                1,
                3600,
                self.max_observer_lag as u128,
            ));
        }
        if self.max_blob_length == 0 {
            return Err(NetplayError::InvalidConfig {
                info: "max_blob_length must be positive".to_owned(),
            });
        }
        Ok(())
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
    fn defaults_and_presets_validate() {
        for config in [
            SessionConfig::default(),
            SessionConfig::lan(),
            SessionConfig::high_latency(),
        ] {
            config.validate().unwrap();
        }
        for config in [
            ReplicationConfig::default(),
            ReplicationConfig::lan(),
            ReplicationConfig::constrained(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn default_values() {
        let session = SessionConfig::default();
        assert_eq!(session.max_players, 16);
        assert_eq!(session.lag_depth, 4);
        assert_eq!(session.handshake_timeout, Duration::from_millis(5000));
        assert_eq!(session.channel_count, 18);

        let replication = ReplicationConfig::default();
        assert_eq!(replication.chunk_size, 0x1_0000 - 16);
        assert_eq!(replication.sync_timeout, Duration::from_secs(300));
        assert_eq!(replication.max_blob_length, 0x4000_0000);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let too_many = SessionConfig {
            max_players: 17,
            ..SessionConfig::default()
        };
        let err = too_many.validate().unwrap_err();
        assert!(matches!(err, NetplayError::InvalidConfig { ref info } if info.contains("max_players")));

        let no_lag = SessionConfig {
            lag_depth: 0,
            ..SessionConfig::default()
        };
        assert!(no_lag.validate().is_err());

        let few_channels = SessionConfig {
            channel_count: 17,
            ..SessionConfig::default()
        };
        assert!(few_channels.validate().is_err());

        let huge_chunks = ReplicationConfig {
            chunk_size: MAX_CHUNK_SIZE + 1,
            ..ReplicationConfig::default()
        };
        assert!(huge_chunks.validate().is_err());

        let no_lag_tolerance = ReplicationConfig {
            max_observer_lag: 0,
            ..ReplicationConfig::default()
        };
        assert!(no_lag_tolerance.validate().is_err());
    }
}
