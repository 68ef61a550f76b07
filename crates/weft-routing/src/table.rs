//! The table of best-known originator advertisements
//!
//! One entry per origin address, replaced wholesale whenever a better
//! advertisement arrives and evicted after the lost-node timeout. A
//! revision counter published through a watch channel lets callers wait
//! for table changes without polling.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;

use weft_core::VirtualAddress;
use weft_link::LinkId;

/// One remembered advertisement: the best recent claim about how to reach
/// an origin, plus where it came from.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// The advertising node.
    pub origin: VirtualAddress,
    /// Wall-clock send time stamped by the origin, Unix milliseconds.
    pub sent_time: i64,
    /// Path latency accumulated on the way here, milliseconds.
    pub ping_time_sum: i16,
    /// Hops the advertisement took; 1 means the origin is adjacent.
    pub hop_count: u8,
    /// The origin's opaque capability payload.
    pub blob: Bytes,
    /// The adjacent node the advertisement arrived from, and therefore
    /// the next hop toward the origin.
    pub last_hop_addr: VirtualAddress,
    /// The adjacent node's real service endpoint, when known.
    pub last_hop_service: Option<SocketAddr>,
    /// The link the advertisement arrived on.
    pub link: LinkId,
    /// When this entry was stored, for eviction.
    pub received_at: Instant,
}

/// The acceptance rule: a candidate advertisement replaces the current
/// entry when it is strictly newer, or equally new over fewer hops.
pub fn is_more_recent_or_better(sent_time: i64, hop_count: u8, current: &RouteEntry) -> bool {
    sent_time > current.sent_time
        || (sent_time == current.sent_time && hop_count < current.hop_count)
}

/// What [`OriginatorTable::observe`] did with a candidate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOutcome {
    /// The candidate replaced (or created) the entry.
    pub accepted: bool,
    /// No entry for this origin existed before.
    pub new_origin: bool,
}

/// Best-known advertisement per origin.
///
/// All operations are atomic per entry; an accepted candidate replaces
/// the whole entry, never merges into it.
pub struct OriginatorTable {
    routes: DashMap<VirtualAddress, RouteEntry>,
    revision: watch::Sender<u64>,
}

impl OriginatorTable {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            routes: DashMap::new(),
            revision,
        }
    }

    /// Apply the acceptance rule to a candidate entry.
    pub fn observe(&self, entry: RouteEntry) -> ObserveOutcome {
        use dashmap::mapref::entry::Entry;

        let outcome = match self.routes.entry(entry.origin) {
            Entry::Occupied(mut slot) => {
                if is_more_recent_or_better(entry.sent_time, entry.hop_count, slot.get()) {
                    slot.insert(entry);
                    ObserveOutcome {
                        accepted: true,
                        new_origin: false,
                    }
                } else {
                    ObserveOutcome {
                        accepted: false,
                        new_origin: false,
                    }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                ObserveOutcome {
                    accepted: true,
                    new_origin: true,
                }
            }
        };
        if outcome.accepted {
            self.bump_revision();
        }
        outcome
    }

    pub fn get(&self, origin: VirtualAddress) -> Option<RouteEntry> {
        self.routes.get(&origin).map(|entry| entry.clone())
    }

    pub fn contains(&self, origin: VirtualAddress) -> bool {
        self.routes.contains_key(&origin)
    }

    pub fn remove(&self, origin: VirtualAddress) -> Option<RouteEntry> {
        let removed = self.routes.remove(&origin).map(|(_, entry)| entry);
        if removed.is_some() {
            self.bump_revision();
        }
        removed
    }

    /// Evict entries not refreshed within `lost_timeout`, returning them.
    ///
    /// Removal is atomic against concurrent refreshes: an entry that is
    /// re-observed between the scan and the removal stays.
    pub fn prune_lost(&self, lost_timeout: Duration) -> Vec<RouteEntry> {
        let now = Instant::now();
        let candidates: Vec<VirtualAddress> = self
            .routes
            .iter()
            .filter(|entry| now.duration_since(entry.received_at) >= lost_timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = Vec::new();
        for origin in candidates {
            if let Some((_, entry)) = self
                .routes
                .remove_if(&origin, |_, entry| {
                    now.duration_since(entry.received_at) >= lost_timeout
                })
            {
                removed.push(entry);
            }
        }
        if !removed.is_empty() {
            self.bump_revision();
        }
        removed
    }

    /// Every entry, in no particular order.
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        self.routes.iter().map(|entry| entry.clone()).collect()
    }

    /// Entries whose origin is adjacent (hop count 1).
    pub fn neighbors(&self) -> Vec<RouteEntry> {
        self.routes
            .iter()
            .filter(|entry| entry.hop_count == 1)
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&self) {
        self.routes.clear();
        self.bump_revision();
    }

    /// Watch the table revision; it bumps on every accepted observation
    /// and every removal.
    pub fn revision_watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

impl Default for OriginatorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tail: u8) -> VirtualAddress {
        VirtualAddress::from_octets([169, 254, 0, tail])
    }

    fn make_entry(origin: u8, via: u8, sent_time: i64, hop_count: u8) -> RouteEntry {
        RouteEntry {
            origin: addr(origin),
            sent_time,
            ping_time_sum: 0,
            hop_count,
            blob: Bytes::new(),
            last_hop_addr: addr(via),
            last_hop_service: None,
            link: LinkId(1),
            received_at: Instant::now(),
        }
    }

    #[test]
    fn test_first_observation_is_accepted() {
        let table = OriginatorTable::new();
        let outcome = table.observe(make_entry(5, 2, 1000, 2));
        assert!(outcome.accepted);
        assert!(outcome.new_origin);

        let entry = table.get(addr(5)).unwrap();
        assert_eq!(entry.last_hop_addr, addr(2));
        assert_eq!(entry.hop_count, 2);
    }

    #[test]
    fn test_newer_advertisement_replaces() {
        let table = OriginatorTable::new();
        table.observe(make_entry(5, 2, 1000, 2));

        let outcome = table.observe(make_entry(5, 3, 2000, 4));
        assert!(outcome.accepted);
        assert!(!outcome.new_origin);

        // Replaced wholesale, even though the path got longer
        let entry = table.get(addr(5)).unwrap();
        assert_eq!(entry.sent_time, 2000);
        assert_eq!(entry.hop_count, 4);
        assert_eq!(entry.last_hop_addr, addr(3));
    }

    #[test]
    fn test_older_advertisement_is_rejected() {
        let table = OriginatorTable::new();
        table.observe(make_entry(5, 2, 2000, 2));

        let outcome = table.observe(make_entry(5, 3, 1000, 1));
        assert!(!outcome.accepted);
        assert_eq!(table.get(addr(5)).unwrap().last_hop_addr, addr(2));
    }

    #[test]
    fn test_equal_time_shorter_path_wins() {
        let table = OriginatorTable::new();
        table.observe(make_entry(5, 2, 1000, 3));

        // Same send time, fewer hops: accepted
        let outcome = table.observe(make_entry(5, 3, 1000, 2));
        assert!(outcome.accepted);
        assert_eq!(table.get(addr(5)).unwrap().hop_count, 2);

        // Same send time, same hops: rejected
        let outcome = table.observe(make_entry(5, 4, 1000, 2));
        assert!(!outcome.accepted);
        assert_eq!(table.get(addr(5)).unwrap().last_hop_addr, addr(3));
    }

    #[test]
    fn test_prune_lost() {
        let table = OriginatorTable::new();
        table.observe(make_entry(5, 2, 1000, 2));

        std::thread::sleep(Duration::from_millis(20));
        table.observe(make_entry(6, 2, 1000, 1));

        let removed = table.prune_lost(Duration::from_millis(10));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].origin, addr(5));

        assert!(table.get(addr(5)).is_none());
        assert!(table.get(addr(6)).is_some());
    }

    #[test]
    fn test_refresh_prevents_eviction() {
        let table = OriginatorTable::new();
        table.observe(make_entry(5, 2, 1000, 2));

        std::thread::sleep(Duration::from_millis(20));
        // A newer advertisement refreshes received_at
        table.observe(make_entry(5, 2, 2000, 2));

        let removed = table.prune_lost(Duration::from_millis(15));
        assert!(removed.is_empty());
        assert!(table.get(addr(5)).is_some());
    }

    #[test]
    fn test_neighbors_filters_hop_one() {
        let table = OriginatorTable::new();
        table.observe(make_entry(5, 5, 1000, 1));
        table.observe(make_entry(6, 5, 1000, 2));

        let neighbors = table.neighbors();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].origin, addr(5));
    }

    #[test]
    fn test_revision_bumps_on_changes() {
        let table = OriginatorTable::new();
        let watch = table.revision_watch();
        let start = *watch.borrow();

        table.observe(make_entry(5, 2, 1000, 2));
        assert_eq!(*watch.borrow(), start + 1);

        // Rejected observation leaves the revision alone
        table.observe(make_entry(5, 2, 500, 2));
        assert_eq!(*watch.borrow(), start + 1);

        table.remove(addr(5));
        assert_eq!(*watch.borrow(), start + 2);
    }
}
