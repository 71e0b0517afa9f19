//! Mapping table: one entry store indexed three ways
//!
//! Every entry is reachable by its source endpoint, by its translated port
//! and through a fixed set of destination buckets. Insert and remove update
//! all three indices together, so an entry is either in all of them or in
//! none. The table itself is not synchronized; [`super::MapList`] wraps it
//! in a lock.

use super::MapError;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::trace;

/// Number of destination buckets. Must be a power of two.
pub const DEST_BUCKETS: usize = 32;

/// Stable identifier of an entry within its table
pub type EntryId = u64;

/// One translated flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Original (internal) address
    pub old_addr: Ipv4Addr,
    /// Original (internal) port, or ICMP identifier
    pub old_port: u16,
    /// Destination the internal endpoint talks to
    pub dst_addr: Ipv4Addr,
    /// Translated port from the shared pool
    pub new_port: u16,
    /// Last lookup hit
    pub last_touched: Instant,
}

/// Destination bucket of an address
pub fn dest_bucket(addr: Ipv4Addr) -> usize {
    let v = u32::from(addr);
    let v = v ^ (v >> 16);
    let v = (v ^ (v >> 8)) & 0xff;
    ((v ^ (v >> 5)) as usize) & (DEST_BUCKETS - 1)
}

/// Per-protocol mapping table
#[derive(Debug)]
pub struct MappingTable {
    entries: HashMap<EntryId, MappingEntry>,
    /// (old_addr, old_port) -> entries, for outbound lookups
    by_source: HashMap<(Ipv4Addr, u16), Vec<EntryId>>,
    /// new_port -> entries, for inbound lookups and port usage
    by_port: HashMap<u16, Vec<EntryId>>,
    /// dest_bucket(dst_addr) -> entries, for multiplex candidates
    by_dest: Vec<Vec<EntryId>>,
    next_id: EntryId,
    /// Distinct new_port values among live entries
    allocated_ports: usize,
    /// Rover cursor for fresh allocation
    last_allocated_port: u16,
    timeout: Duration,
    max_entries: Option<usize>,
}

impl MappingTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            by_source: HashMap::new(),
            by_port: HashMap::new(),
            by_dest: vec![Vec::new(); DEST_BUCKETS],
            next_id: 0,
            allocated_ports: 0,
            last_allocated_port: 0,
            timeout,
            max_entries: None,
        }
    }

    /// Cap the number of entries; inserts beyond it fail with `AllocationFailure`
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of entries (flows)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct translated ports in use
    pub fn allocated_ports(&self) -> usize {
        self.allocated_ports
    }

    pub fn last_allocated_port(&self) -> u16 {
        self.last_allocated_port
    }

    /// Account for a port that was not in use before this allocation
    pub fn record_allocation(&mut self, port: u16) {
        self.last_allocated_port = port;
        self.allocated_ports += 1;
    }

    pub fn get(&self, id: EntryId) -> Option<&MappingEntry> {
        self.entries.get(&id)
    }

    /// Refresh the timestamp of an entry
    pub fn touch(&mut self, id: EntryId, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_touched = now;
        }
    }

    /// Insert an entry into the store and all three indices
    ///
    /// Capacity for every index is reserved before anything is linked, so a
    /// failure leaves the table unchanged.
    pub fn insert(&mut self, entry: MappingEntry) -> Result<EntryId, MapError> {
        if self.max_entries.is_some_and(|max| self.entries.len() >= max) {
            return Err(MapError::AllocationFailure);
        }

        let bucket = dest_bucket(entry.dst_addr);
        self.entries
            .try_reserve(1)
            .map_err(|_| MapError::AllocationFailure)?;
        reserve_slot(&mut self.by_source, (entry.old_addr, entry.old_port))?;
        reserve_slot(&mut self.by_port, entry.new_port)?;
        self.by_dest[bucket]
            .try_reserve(1)
            .map_err(|_| MapError::AllocationFailure)?;

        let id = self.next_id;
        self.next_id += 1;

        self.by_source
            .entry((entry.old_addr, entry.old_port))
            .or_default()
            .push(id);
        self.by_port.entry(entry.new_port).or_default().push(id);
        self.by_dest[bucket].push(id);
        self.entries.insert(id, entry);

        Ok(id)
    }

    /// Remove an entry from the store and all three indices
    ///
    /// Does not adjust `allocated_ports`; callers that drop the last user
    /// of a port account for it (see [`MappingTable::sweep`]).
    pub fn remove(&mut self, id: EntryId) -> Option<MappingEntry> {
        let entry = self.entries.remove(&id)?;

        unlink(&mut self.by_source, (entry.old_addr, entry.old_port), id);
        unlink(&mut self.by_port, entry.new_port, id);
        let bucket = &mut self.by_dest[dest_bucket(entry.dst_addr)];
        if let Some(pos) = bucket.iter().position(|&i| i == id) {
            bucket.swap_remove(pos);
        }

        Some(entry)
    }

    /// Entries sharing a source endpoint (they differ by destination)
    pub fn find_by_source(
        &self,
        old_addr: Ipv4Addr,
        old_port: u16,
    ) -> impl Iterator<Item = (EntryId, &MappingEntry)> + '_ {
        self.lookup(self.by_source.get(&(old_addr, old_port)))
    }

    /// Entries holding a translated port
    pub fn find_by_port(
        &self,
        new_port: u16,
    ) -> impl Iterator<Item = (EntryId, &MappingEntry)> + '_ {
        self.lookup(self.by_port.get(&new_port))
    }

    /// Entries talking to one destination
    pub fn find_by_destination(
        &self,
        dst_addr: Ipv4Addr,
    ) -> impl Iterator<Item = (EntryId, &MappingEntry)> + '_ {
        self.bucket(dest_bucket(dst_addr))
            .filter(move |(_, entry)| entry.dst_addr == dst_addr)
    }

    /// All entries of one destination bucket
    pub fn bucket(&self, index: usize) -> impl Iterator<Item = (EntryId, &MappingEntry)> + '_ {
        let ids = self.by_dest.get(index).map(Vec::as_slice).unwrap_or_default();
        ids.iter()
            .filter_map(move |id| self.entries.get(id).map(|entry| (*id, entry)))
    }

    /// Whether any live entry holds `port`
    pub fn port_in_use(&self, port: u16) -> bool {
        self.by_port.get(&port).is_some_and(|ids| !ids.is_empty())
    }

    /// Whether `port` is already bound to `dst_addr` by some entry
    pub fn port_bound_to(&self, port: u16, dst_addr: Ipv4Addr) -> bool {
        self.find_by_destination(dst_addr)
            .any(|(_, entry)| entry.new_port == port)
    }

    /// Iterate over all entries
    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> + '_ {
        self.entries.values()
    }

    /// Evict every entry idle for at least `timeout`
    ///
    /// Returns the number of evicted entries. `allocated_ports` drops by one
    /// for each evicted entry whose port has no remaining user.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let expired: Vec<EntryId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_touched) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for &id in &expired {
            let Some(entry) = self.remove(id) else {
                continue;
            };
            trace!(
                "Evicted {}:{} -> {} on port {}",
                entry.old_addr,
                entry.old_port,
                entry.dst_addr,
                entry.new_port
            );
            if !self.port_in_use(entry.new_port) {
                self.allocated_ports = self.allocated_ports.saturating_sub(1);
            }
        }

        expired.len()
    }

    /// Drop every entry and reset the port count
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.by_source.clear();
        self.by_port.clear();
        self.by_dest.iter_mut().for_each(Vec::clear);
        self.allocated_ports = 0;
        removed
    }

    fn lookup<'a>(
        &'a self,
        ids: Option<&'a Vec<EntryId>>,
    ) -> impl Iterator<Item = (EntryId, &'a MappingEntry)> + 'a {
        ids.into_iter()
            .flatten()
            .filter_map(move |id| self.entries.get(id).map(|entry| (*id, entry)))
    }
}

/// Make room for one more id under `key` without linking anything
fn reserve_slot<K: Hash + Eq>(
    index: &mut HashMap<K, Vec<EntryId>>,
    key: K,
) -> Result<(), MapError> {
    index
        .try_reserve(1)
        .map_err(|_| MapError::AllocationFailure)?;
    if let Some(ids) = index.get_mut(&key) {
        ids.try_reserve(1)
            .map_err(|_| MapError::AllocationFailure)?;
    }
    Ok(())
}

fn unlink<K: Hash + Eq>(index: &mut HashMap<K, Vec<EntryId>>, key: K, id: EntryId) {
    let Some(ids) = index.get_mut(&key) else {
        return;
    };
    if let Some(pos) = ids.iter().position(|&i| i == id) {
        ids.swap_remove(pos);
    }
    if ids.is_empty() {
        index.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        old: [u8; 4],
        old_port: u16,
        dst: [u8; 4],
        new_port: u16,
        at: Instant,
    ) -> MappingEntry {
        MappingEntry {
            old_addr: Ipv4Addr::from(old),
            old_port,
            dst_addr: Ipv4Addr::from(dst),
            new_port,
            last_touched: at,
        }
    }

    #[test]
    fn test_dest_bucket_in_range() {
        for i in 0..=255u8 {
            assert!(dest_bucket(Ipv4Addr::new(10, 0, i, 1)) < DEST_BUCKETS);
        }
    }

    #[test]
    fn test_insert_links_all_indices() {
        let now = Instant::now();
        let mut table = MappingTable::new(Duration::from_secs(15));
        let id = table
            .insert(entry([10, 0, 0, 1], 5000, [8, 8, 8, 8], 2048, now))
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.find_by_source(Ipv4Addr::new(10, 0, 0, 1), 5000).count(), 1);
        assert_eq!(table.find_by_port(2048).next().map(|(i, _)| i), Some(id));
        assert_eq!(table.find_by_destination(Ipv4Addr::new(8, 8, 8, 8)).count(), 1);
        assert!(table.port_in_use(2048));
        assert!(table.port_bound_to(2048, Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!table.port_bound_to(2048, Ipv4Addr::new(1, 1, 1, 1)));
    }

    #[test]
    fn test_remove_unlinks_all_indices() {
        let now = Instant::now();
        let mut table = MappingTable::new(Duration::from_secs(15));
        let a = table
            .insert(entry([10, 0, 0, 1], 5000, [8, 8, 8, 8], 2048, now))
            .unwrap();
        let b = table
            .insert(entry([10, 0, 0, 1], 5000, [1, 1, 1, 1], 2048, now))
            .unwrap();

        let removed = table.remove(a).unwrap();
        assert_eq!(removed.dst_addr, Ipv4Addr::new(8, 8, 8, 8));
        assert!(table.get(a).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.port_in_use(2048));
        assert_eq!(table.find_by_destination(Ipv4Addr::new(8, 8, 8, 8)).count(), 0);

        table.remove(b);
        assert!(table.is_empty());
        assert!(!table.port_in_use(2048));
        assert_eq!(table.find_by_source(Ipv4Addr::new(10, 0, 0, 1), 5000).count(), 0);
        assert!(table.remove(b).is_none());
    }

    #[test]
    fn test_max_entries() {
        let now = Instant::now();
        let mut table = MappingTable::new(Duration::from_secs(15)).with_max_entries(1);
        table
            .insert(entry([10, 0, 0, 1], 5000, [8, 8, 8, 8], 2048, now))
            .unwrap();
        let err = table
            .insert(entry([10, 0, 0, 2], 5000, [8, 8, 8, 8], 2049, now))
            .unwrap_err();
        assert_eq!(err, MapError::AllocationFailure);
        assert_eq!(table.len(), 1);
        assert!(!table.port_in_use(2049));
    }

    #[test]
    fn test_sweep_keeps_shared_port_counted() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(10);
        let mut table = MappingTable::new(Duration::from_secs(15));

        table
            .insert(entry([10, 0, 0, 1], 5000, [8, 8, 8, 8], 2048, t0))
            .unwrap();
        table.record_allocation(2048);
        table
            .insert(entry([10, 0, 0, 2], 6000, [1, 1, 1, 1], 2048, t1))
            .unwrap();
        table
            .insert(entry([10, 0, 0, 3], 7000, [8, 8, 8, 8], 2049, t0))
            .unwrap();
        table.record_allocation(2049);
        assert_eq!(table.allocated_ports(), 2);

        // First and third expire; 2048 is still held by the second entry
        let evicted = table.sweep(t0 + Duration::from_secs(15));
        assert_eq!(evicted, 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.allocated_ports(), 1);
        assert!(table.port_in_use(2048));
        assert!(!table.port_in_use(2049));

        assert_eq!(table.sweep(t1 + Duration::from_secs(15)), 1);
        assert_eq!(table.allocated_ports(), 0);
    }

    #[test]
    fn test_touch_defers_expiry() {
        let t0 = Instant::now();
        let mut table = MappingTable::new(Duration::from_secs(15));
        let id = table
            .insert(entry([10, 0, 0, 1], 5000, [8, 8, 8, 8], 2048, t0))
            .unwrap();

        table.touch(id, t0 + Duration::from_secs(10));
        assert_eq!(table.sweep(t0 + Duration::from_secs(20)), 0);
        assert_eq!(table.sweep(t0 + Duration::from_secs(25)), 1);
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let mut table = MappingTable::new(Duration::from_secs(15));
        for i in 0..10u16 {
            table
                .insert(entry([10, 0, 0, 1], 5000 + i, [8, 8, 8, 8], 2048 + i, now))
                .unwrap();
            table.record_allocation(2048 + i);
        }
        assert_eq!(table.clear(), 10);
        assert!(table.is_empty());
        assert_eq!(table.allocated_ports(), 0);
        assert!(!table.port_in_use(2048));
        assert_eq!(table.bucket(dest_bucket(Ipv4Addr::new(8, 8, 8, 8))).count(), 0);
    }
}
