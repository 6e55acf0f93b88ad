//! The roster: sixteen player slots behind one mutex.
//!
//! The registry is the only session state shared across threads. Every accessor
//! copies what it needs while holding the lock and releases it before returning,
//! so callers never act on roster data with the lock held.

use std::net::{IpAddr, Ipv4Addr};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{PlayerId, MAX_PLAYERS};

/// Longest name in bytes. The wire format reserves a 32-byte field with a terminator.
pub const MAX_NAME_LEN: usize = 31;

/// The address local records are reported with.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A display name of at most [`MAX_NAME_LEN`] bytes with no NUL.
///
/// Construction never fails: anything after a NUL is dropped, then the name is
/// cut to fit on a character boundary.
///
/// ```
/// use lockstep_netplay::PlayerName;
///
/// assert_eq!(PlayerName::new("Arisotura").as_str(), "Arisotura");
/// assert_eq!(PlayerName::new("abc\0def").as_str(), "abc");
/// assert_eq!(PlayerName::new(&"x".repeat(40)).as_str().len(), 31);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PlayerName(String);

impl PlayerName {
    /// Sanitizes `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let name = name.split('\0').next().unwrap_or_default();
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self(name[..end].to_owned())
    }

    /// The sanitized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PlayerName {
    fn from(name: String) -> Self {
        Self::new(&name)
    }
}

impl From<PlayerName> for String {
    fn from(name: PlayerName) -> Self {
        name.0
    }
}

impl std::fmt::Display for PlayerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a slot is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlayerStatus {
    /// Free slot.
    #[default]
    None,
    /// Slot reserved, waiting for the peer's player info.
    Connecting,
    /// Registered client, reachable for mesh connections.
    Connected,
    /// The host. Exactly one per active session.
    Host,
    /// The local client before the first roster arrives.
    Client,
}

impl PlayerStatus {
    /// Returns `true` unless the slot is free.
    #[must_use]
    pub const fn is_occupied(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// One roster entry.
///
/// `is_local` is derived on each side and never sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Slot, equal to the record's index in the roster.
    pub id: PlayerId,
    /// Display name.
    pub name: PlayerName,
    /// Lifecycle state.
    pub status: PlayerStatus,
    /// Network address as observed by the host.
    pub address: IpAddr,
    /// This record is the local participant.
    #[serde(skip)]
    pub is_local: bool,
}

impl PlayerRecord {
    /// A free slot.
    #[must_use]
    pub fn empty(id: PlayerId) -> Self {
        Self {
            id,
            name: PlayerName::default(),
            status: PlayerStatus::None,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            is_local: false,
        }
    }

    /// Returns `true` unless the slot is free.
    #[must_use]
    pub const fn is_occupied(&self) -> bool {
        self.status.is_occupied()
    }
}

impl Default for PlayerRecord {
    fn default() -> Self {
        Self::empty(PlayerId::HOST)
    }
}

/// The full slot table.
pub type RosterSlots = [PlayerRecord; MAX_PLAYERS];

fn empty_slots() -> RosterSlots {
    std::array::from_fn(|index| PlayerRecord::empty(PlayerId::new(index as u8)))
}

#[derive(Debug)]
struct Roster {
    slots: RosterSlots,
    local: Option<PlayerId>,
    host_address: Option<IpAddr>,
}

/// Mutex-guarded roster shared between the network path and UI-facing readers.
#[derive(Debug)]
pub struct PlayerRegistry {
    roster: Mutex<Roster>,
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerRegistry {
    /// Creates a registry with every slot free.
    #[must_use]
    pub fn new() -> Self {
        Self {
            roster: Mutex::new(Roster {
                slots: empty_slots(),
                local: None,
                host_address: None,
            }),
        }
    }

    /// Occupied slots in slot order, with addresses normalized.
    ///
    /// The local record reports [`LOOPBACK`]. The host record reports the
    /// host's address when it is known on this side.
    #[must_use]
    pub fn list_players(&self) -> Vec<PlayerRecord> {
        let roster = self.roster.lock();
        roster
            .slots
            .iter()
            .filter(|record| record.is_occupied())
            .map(|record| {
                let mut record = record.clone();
                if record.is_local {
                    record.address = LOOPBACK;
                } else if record.status == PlayerStatus::Host {
                    if let Some(host) = roster.host_address {
                        record.address = host;
                    }
                }
                record
            })
            .collect()
    }

    /// Copy of all sixteen slots, unnormalized.
    #[must_use]
    pub fn snapshot(&self) -> RosterSlots {
        self.roster.lock().slots.clone()
    }

    /// Copy of one slot.
    #[must_use]
    pub fn get(&self, id: PlayerId) -> Option<PlayerRecord> {
        self.roster.lock().slots.get(id.as_usize()).cloned()
    }

    /// Writes `record` into the slot named by its id. Out-of-range ids are ignored.
    pub fn upsert(&self, mut record: PlayerRecord) {
        let mut roster = self.roster.lock();
        record.is_local = roster.local == Some(record.id);
        if let Some(slot) = roster.slots.get_mut(record.id.as_usize()) {
            *slot = record;
        }
    }

    /// Changes one slot's status.
    pub fn set_status(&self, id: PlayerId, status: PlayerStatus) {
        if let Some(slot) = self.roster.lock().slots.get_mut(id.as_usize()) {
            slot.status = status;
        }
    }

    /// Frees a slot. Returns the record that was there if it was occupied.
    pub fn clear_slot(&self, id: PlayerId) -> Option<PlayerRecord> {
        let mut roster = self.roster.lock();
        let slot = roster.slots.get_mut(id.as_usize())?;
        let previous = std::mem::replace(slot, PlayerRecord::empty(id));
        previous.is_occupied().then_some(previous)
    }

    /// Lowest free slot below `limit`.
    #[must_use]
    pub fn lowest_free_slot(&self, limit: usize) -> Option<PlayerId> {
        let roster = self.roster.lock();
        roster
            .slots
            .iter()
            .take(limit.min(MAX_PLAYERS))
            .find(|record| !record.is_occupied())
            .map(|record| record.id)
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.roster
            .lock()
            .slots
            .iter()
            .filter(|record| record.is_occupied())
            .count()
    }

    /// Marks `id` as the local participant.
    pub fn set_local(&self, id: PlayerId) {
        let mut roster = self.roster.lock();
        roster.local = Some(id);
        for record in &mut roster.slots {
            record.is_local = record.id == id;
        }
    }

    /// The local participant's slot.
    #[must_use]
    pub fn local_id(&self) -> Option<PlayerId> {
        self.roster.lock().local
    }

    /// Records the host's address as seen from a client.
    pub fn set_host_address(&self, address: IpAddr) {
        self.roster.lock().host_address = Some(address);
    }

    /// Replaces every slot with a roster received from the host.
    ///
    /// Record `i` lands in slot `i`. Returns `false` and leaves the roster alone
    /// if the table does not have sixteen entries, an occupied entry's id does
    /// not match its index, or the table does not hold exactly one host.
    pub fn replace_all(&self, players: &[PlayerRecord]) -> bool {
        if players.len() != MAX_PLAYERS {
            return false;
        }
        let consistent = players
            .iter()
            .enumerate()
            .all(|(index, record)| !record.is_occupied() || record.id.as_usize() == index);
        let hosts = players
            .iter()
            .filter(|record| record.status == PlayerStatus::Host)
            .count();
        if !consistent || hosts != 1 {
            return false;
        }

        let mut roster = self.roster.lock();
        let local = roster.local;
        for (index, (slot, incoming)) in roster.slots.iter_mut().zip(players).enumerate() {
            let id = PlayerId::new(index as u8);
            *slot = if incoming.is_occupied() {
                PlayerRecord {
                    id,
                    is_local: local == Some(id),
                    ..incoming.clone()
                }
            } else {
                PlayerRecord::empty(id)
            };
        }
        true
    }

    /// First occupied slot other than the local one whose address and status match.
    #[must_use]
    pub fn find_by_address(&self, address: IpAddr, status: PlayerStatus) -> Option<PlayerId> {
        let roster = self.roster.lock();
        roster
            .slots
            .iter()
            .find(|record| !record.is_local && record.status == status && record.address == address)
            .map(|record| record.id)
    }

    /// Frees every slot and forgets the local id and host address.
    pub fn clear(&self) {
        let mut roster = self.roster.lock();
        roster.slots = empty_slots();
        roster.local = None;
        roster.host_address = None;
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

    fn record(id: u8, status: PlayerStatus, last_octet: u8) -> PlayerRecord {
        PlayerRecord {
            id: PlayerId::new(id),
            name: PlayerName::new(&format!("p{id}")),
            status,
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            is_local: false,
        }
    }

    #[test]
    fn name_truncation_respects_char_boundaries() {
        let name = PlayerName::new(&"é".repeat(20));
        assert!(name.as_str().len() <= MAX_NAME_LEN);
        assert_eq!(name.as_str().len(), 30);
    }

    #[test]
    fn name_is_sanitized_on_decode() {
        let name: PlayerName = String::from("bob\0junk").into();
        assert_eq!(name.as_str(), "bob");
    }

    #[test]
    fn new_registry_is_empty() {
        let registry = PlayerRegistry::new();
        assert_eq!(registry.num_players(), 0);
        assert!(registry.list_players().is_empty());
        assert_eq!(registry.lowest_free_slot(16), Some(PlayerId::new(0)));
    }

    #[test]
    fn lowest_free_slot_respects_limit() {
        let registry = PlayerRegistry::new();
        registry.upsert(record(0, PlayerStatus::Host, 1));
        registry.upsert(record(1, PlayerStatus::Connected, 2));
        assert_eq!(registry.lowest_free_slot(2), None);
        assert_eq!(registry.lowest_free_slot(4), Some(PlayerId::new(2)));

        registry.clear_slot(PlayerId::new(1));
        assert_eq!(registry.lowest_free_slot(2), Some(PlayerId::new(1)));
    }

    #[test]
    fn local_and_host_addresses_are_normalized() {
        let registry = PlayerRegistry::new();
        registry.set_local(PlayerId::new(2));
        registry.set_host_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        registry.upsert(record(0, PlayerStatus::Host, 1));
        registry.upsert(record(2, PlayerStatus::Client, 3));

        let players = registry.list_players();
        assert_eq!(players.len(), 2);
        assert_eq!(
            players[0].address,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert!(players[1].is_local);
        assert_eq!(players[1].address, LOOPBACK);
    }

    #[test]
    fn replace_all_keeps_local_flag() {
        let registry = PlayerRegistry::new();
        registry.set_local(PlayerId::new(1));

        let mut table = empty_slots();
        table[0] = record(0, PlayerStatus::Host, 1);
        table[1] = record(1, PlayerStatus::Connected, 2);
        assert!(registry.replace_all(&table));

        let local = registry.get(PlayerId::new(1)).unwrap();
        assert!(local.is_local);
        assert_eq!(registry.num_players(), 2);
    }

    #[test]
    fn replace_all_rejects_misplaced_records() {
        let registry = PlayerRegistry::new();
        let mut table = empty_slots();
        table[3] = record(5, PlayerStatus::Connected, 2);
        assert!(!registry.replace_all(&table));
        assert!(!registry.replace_all(&table[..4]));
        assert_eq!(registry.num_players(), 0);
    }

    #[test]
    fn replace_all_requires_exactly_one_host() {
        let registry = PlayerRegistry::new();
        registry.upsert(record(0, PlayerStatus::Host, 1));

        let mut headless = empty_slots();
        headless[0] = record(0, PlayerStatus::Connected, 1);
        headless[1] = record(1, PlayerStatus::Connected, 2);
        assert!(!registry.replace_all(&headless));

        let mut two_hosts = headless.clone();
        two_hosts[0].status = PlayerStatus::Host;
        two_hosts[1].status = PlayerStatus::Host;
        assert!(!registry.replace_all(&two_hosts));

        assert_eq!(registry.num_players(), 1);
        assert_eq!(
            registry.get(PlayerId::HOST).unwrap().status,
            PlayerStatus::Host
        );
    }

    #[test]
    fn find_by_address_skips_local_and_other_statuses() {
        let registry = PlayerRegistry::new();
        registry.set_local(PlayerId::new(1));
        registry.upsert(record(1, PlayerStatus::Connected, 2));
        registry.upsert(record(2, PlayerStatus::Connecting, 3));
        registry.upsert(record(3, PlayerStatus::Connected, 3));

        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(registry.find_by_address(addr, PlayerStatus::Connected), None);
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(
            registry.find_by_address(addr, PlayerStatus::Connected),
            Some(PlayerId::new(3))
        );
    }

    #[test]
    fn clear_frees_everything() {
        let registry = PlayerRegistry::new();
        registry.set_local(PlayerId::HOST);
        registry.upsert(record(0, PlayerStatus::Host, 1));
        registry.clear();
        assert_eq!(registry.num_players(), 0);
        assert_eq!(registry.local_id(), None);
    }

    #[test]
    fn registry_is_shareable_across_threads() {
        let registry = std::sync::Arc::new(PlayerRegistry::new());
        let writer = {
            let registry = std::sync::Arc::clone(&registry);
            std::thread::spawn(move || {
                for id in 0..16 {
                    registry.upsert(record(id, PlayerStatus::Connected, id));
                }
            })
        };
        for _ in 0..100 {
            let players = registry.list_players();
            let mut ids: Vec<_> = players.iter().map(|p| p.id).collect();
            ids.dedup();
            assert_eq!(ids.len(), players.len());
        }
        writer.join().unwrap();
        assert_eq!(registry.num_players(), 16);
    }
}
