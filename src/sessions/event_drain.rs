use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::NetplayEvent;

/// Draining iterator over a session's queued [`NetplayEvent`]s.
///
/// Obtain one with [`NetplaySession::events`](crate::NetplaySession::events).
/// Events not consumed before the iterator is dropped are discarded.
///
/// ```ignore
/// for event in session.events() {
///     if let NetplayEvent::PlayerJoined { player, name } = event {
///         info!("{name} joined as player {player}");
///     }
/// }
/// ```
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: Drain<'a, NetplayEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(drain: Drain<'a, NetplayEvent>) -> Self {
        Self { inner: drain }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = NetplayEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::iter_with_drain
)]
mod tests {
    use super::*;
    use crate::PlayerId;
    use std::collections::VecDeque;

    fn left(id: u8) -> NetplayEvent {
        NetplayEvent::PlayerLeft {
            player: PlayerId::new(id),
        }
    }

    #[test]
    fn drain_yields_events_in_order_and_empties_queue() {
        let mut queue: VecDeque<NetplayEvent> = [left(1), left(2), left(3)].into();
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(events, vec![left(1), left(2), left(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_is_double_ended_and_sized() {
        let mut queue: VecDeque<NetplayEvent> = [left(1), left(2), left(3)].into();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 3);
        assert_eq!(drain.next_back(), Some(left(3)));
        assert_eq!(drain.next(), Some(left(1)));
        assert_eq!(drain.len(), 1);
        assert!(format!("{drain:?}").contains("remaining: 1"));
    }

    #[test]
    fn drain_is_fused() {
        let mut queue: VecDeque<NetplayEvent> = VecDeque::from(vec![NetplayEvent::HostLost]);
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert!(drain.next().is_some());
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
    }
}
