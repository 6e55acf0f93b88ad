//! Session-level health, for faults that do not end the session by themselves.

use crate::{Frame, PlayerId};

/// Last fatal-to-session fault seen by a session.
///
/// Lockstep faults stall the simulation rather than tearing the session down.
/// The application decides what to do about them.
///
/// ```ignore
/// match session.health() {
///     SessionHealth::Healthy => {}
///     SessionHealth::InputStarved { player, frame } => {
///         warn!("player {player} has no input for frame {frame}");
///     }
///     SessionHealth::RosterDesync { .. } | SessionHealth::HostLost => session.end_session(),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionHealth {
    /// No fault recorded.
    #[default]
    Healthy,
    /// A player's input queue ran dry. The simulation cannot advance past `frame`.
    InputStarved {
        /// Player with no input.
        player: PlayerId,
        /// Frame that could not be served.
        frame: Frame,
    },
    /// The roster and the instance mapping disagree, e.g. an instance maps to a
    /// slot that is out of range or no longer occupied.
    RosterDesync {
        /// The offending slot number.
        id: u8,
    },
    /// The host connection was lost.
    HostLost,
}

impl SessionHealth {
    /// Returns `true` for [`SessionHealth::Healthy`].
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
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
    fn default_is_healthy() {
        assert!(SessionHealth::default().is_healthy());
    }

    #[test]
    fn faults_are_not_healthy() {
        let starved = SessionHealth::InputStarved {
            player: PlayerId::new(1),
            frame: Frame::new(30),
        };
        assert!(!starved.is_healthy());
        assert!(!SessionHealth::HostLost.is_healthy());
        assert!(format!("{starved:?}").contains("InputStarved"));
    }
}
