//! Role assignment at game start.
//!
//! The local player always runs on instance 0. Every other occupied slot gets
//! the next instance in ascending slot order. The mapping is built once and
//! never changes for the rest of the session.

use crate::input_queue::InputQueue;
use crate::sessions::player_registry::PlayerRecord;
use crate::{PlayerId, MAX_PLAYERS};

/// Instance ↔ player mapping, each the inverse of the other.
///
/// ```
/// use lockstep_netplay::{InstanceMap, PlayerId, PlayerRecord, PlayerStatus};
///
/// let mut roster: Vec<PlayerRecord> = (0..16).map(|i| PlayerRecord::empty(PlayerId::new(i))).collect();
/// roster[0].status = PlayerStatus::Host;
/// roster[2].status = PlayerStatus::Connected;
/// roster[5].status = PlayerStatus::Connected;
///
/// let map = InstanceMap::assign(PlayerId::new(2), &roster);
/// assert_eq!(map.player_for(0), Some(PlayerId::new(2)));
/// assert_eq!(map.player_for(1), Some(PlayerId::new(0)));
/// assert_eq!(map.player_for(2), Some(PlayerId::new(5)));
/// assert_eq!(map.instance_for(PlayerId::new(5)), Some(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstanceMap {
    instance_to_player: [Option<PlayerId>; MAX_PLAYERS],
    player_to_instance: [Option<usize>; MAX_PLAYERS],
    len: usize,
}

impl InstanceMap {
    /// Assigns instances for `local` and every occupied record in `roster`.
    ///
    /// The local player is mapped even if its record is missing.
    #[must_use]
    pub fn assign(local: PlayerId, roster: &[PlayerRecord]) -> Self {
        let mut map = Self::default();
        map.bind(local);
        for record in roster {
            if record.is_occupied() && record.id != local {
                map.bind(record.id);
            }
        }
        map
    }

    fn bind(&mut self, player: PlayerId) {
        let instance = self.len;
        let (Some(to_player), Some(to_instance)) = (
            self.instance_to_player.get_mut(instance),
            self.player_to_instance.get_mut(player.as_usize()),
        ) else {
            return;
        };
        if to_instance.is_some() {
            return;
        }
        *to_player = Some(player);
        *to_instance = Some(instance);
        self.len += 1;
    }

    /// Player driving `instance`.
    #[must_use]
    pub fn player_for(&self, instance: usize) -> Option<PlayerId> {
        self.instance_to_player.get(instance).copied().flatten()
    }

    /// Instance driven by `player`.
    #[must_use]
    pub fn instance_for(&self, player: PlayerId) -> Option<usize> {
        self.player_to_instance
            .get(player.as_usize())
            .copied()
            .flatten()
    }

    /// Number of instances in use.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` before the game has started.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `(instance, player)` pairs in instance order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, PlayerId)> + '_ {
        self.instance_to_player
            .iter()
            .enumerate()
            .filter_map(|(instance, player)| player.map(|player| (instance, player)))
    }

    /// Prefills the queue of every mapped player with `lag_depth` neutral frames.
    pub fn prefill(&self, queues: &mut [InputQueue], lag_depth: usize) {
        for (_, player) in self.iter() {
            if let Some(queue) = queues.get_mut(player.as_usize()) {
                queue.prefill(lag_depth);
            }
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
    use crate::sessions::player_registry::PlayerStatus;
    use crate::Frame;
    use proptest::prelude::*;

    fn roster(occupied: &[u8]) -> Vec<PlayerRecord> {
        (0..MAX_PLAYERS as u8)
            .map(|id| {
                let mut record = PlayerRecord::empty(PlayerId::new(id));
                if occupied.contains(&id) {
                    record.status = if id == 0 {
                        PlayerStatus::Host
                    } else {
                        PlayerStatus::Connected
                    };
                }
                record
            })
            .collect()
    }

    #[test]
    fn host_is_instance_zero_on_the_host() {
        let map = InstanceMap::assign(PlayerId::HOST, &roster(&[0, 1, 3]));
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(
            pairs,
            vec![
                (0, PlayerId::new(0)),
                (1, PlayerId::new(1)),
                (2, PlayerId::new(3))
            ]
        );
    }

    #[test]
    fn empty_map_before_start() {
        let map = InstanceMap::default();
        assert!(map.is_empty());
        assert_eq!(map.player_for(0), None);
    }

    #[test]
    fn local_player_is_mapped_even_without_record() {
        let map = InstanceMap::assign(PlayerId::new(4), &roster(&[0]));
        assert_eq!(map.len(), 2);
        assert_eq!(map.instance_for(PlayerId::new(4)), Some(0));
    }

    #[test]
    fn prefill_touches_only_mapped_players() {
        let map = InstanceMap::assign(PlayerId::new(1), &roster(&[0, 1]));
        let mut queues: Vec<InputQueue> = (0..MAX_PLAYERS).map(|_| InputQueue::new()).collect();
        map.prefill(&mut queues, 4);

        assert_eq!(queues[0].len(), 4);
        assert_eq!(queues[1].len(), 4);
        assert!(queues[2].is_empty());
        assert_eq!(queues[1].front().unwrap().frame, Frame::ZERO);
    }

    proptest! {
        #[test]
        fn mappings_are_inverse_permutations(
            occupied in proptest::collection::btree_set(0_u8..16, 0..16),
            local in 0_u8..16,
        ) {
            let occupied: Vec<u8> = occupied.into_iter().collect();
            let map = InstanceMap::assign(PlayerId::new(local), &roster(&occupied));

            prop_assert_eq!(map.player_for(0), Some(PlayerId::new(local)));
            for (instance, player) in map.iter() {
                prop_assert_eq!(map.instance_for(player), Some(instance));
            }
            let expected = occupied.iter().filter(|&&id| id != local).count() + 1;
            prop_assert_eq!(map.len(), expected);

            let mut previous = None;
            for (_, player) in map.iter().skip(1) {
                prop_assert!(previous.is_none_or(|p: PlayerId| p < player));
                previous = Some(player);
            }
        }
    }
}
