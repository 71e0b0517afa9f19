//! Locked mapping table with the two resolver operations

use super::allocator::{allocate_fresh, find_multiplex_port};
use super::clock::{Clock, SystemClock};
use super::portset::PortSet;
use super::table::{MappingEntry, MappingTable};
use super::MapError;
use crate::telemetry::TableStats;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Where the port of a new flow came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortSource {
    Reused,
    Multiplexed,
    Fresh,
}

struct Inner {
    table: MappingTable,
    rng: StdRng,
}

/// One protocol's mapping table behind a single lock
///
/// Every operation holds the lock for its whole duration, starting with an
/// idle sweep. Callers only ever get copies of addresses and ports back.
pub struct MapList {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    stats: Arc<TableStats>,
}

impl MapList {
    /// Create a table using the system clock and an OS-seeded RNG
    pub fn new(timeout: Duration) -> Self {
        Self::with_parts(
            MappingTable::new(timeout),
            Arc::new(SystemClock),
            StdRng::from_os_rng(),
            Arc::new(TableStats::new()),
        )
    }

    /// Create a table from explicit collaborators
    pub fn with_parts(
        table: MappingTable,
        clock: Arc<dyn Clock>,
        rng: StdRng,
        stats: Arc<TableStats>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner { table, rng }),
            clock,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<TableStats> {
        &self.stats
    }

    pub fn timeout(&self) -> Duration {
        self.lock().table.timeout()
    }

    /// Number of live flows
    pub fn len(&self) -> usize {
        self.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().table.is_empty()
    }

    /// Number of distinct translated ports in use
    pub fn allocated_ports(&self) -> usize {
        self.lock().table.allocated_ports()
    }

    /// Copy of every live entry
    pub fn snapshot(&self) -> Vec<MappingEntry> {
        self.lock().table.entries().cloned().collect()
    }

    /// Translated port for an outbound flow
    ///
    /// Preference order: an existing entry for the exact flow, the port of
    /// another flow from the same source endpoint, a port multiplexed from
    /// another destination, then a fresh port from the pool.
    pub fn resolve_outbound(
        &self,
        old_addr: Ipv4Addr,
        old_port: u16,
        dst_addr: Ipv4Addr,
        ports: &PortSet,
    ) -> Result<u16, MapError> {
        let mut guard = self.lock();
        // Read under the lock so timestamps never run backwards
        let now = self.clock.now();
        let Inner { table, rng } = &mut *guard;
        self.evict(table, now);

        let mut exact = None;
        let mut reuse = None;
        for (id, entry) in table.find_by_source(old_addr, old_port) {
            if entry.dst_addr == dst_addr {
                exact = Some((id, entry.new_port));
                break;
            }
            if reuse.is_none() && !table.port_bound_to(entry.new_port, dst_addr) {
                reuse = Some(entry.new_port);
            }
        }

        if let Some((id, port)) = exact {
            table.touch(id, now);
            self.stats.outbound_hits.inc();
            return Ok(port);
        }

        let (port, source) = if let Some(port) = reuse {
            debug!(
                "Reusing port {} of {}:{} toward {}",
                port, old_addr, old_port, dst_addr
            );
            (port, PortSource::Reused)
        } else if let Some(port) = (!ports.is_one_to_one())
            .then(|| find_multiplex_port(table, dst_addr, ports, rng))
            .flatten()
        {
            (port, PortSource::Multiplexed)
        } else {
            match allocate_fresh(table, old_port, dst_addr, ports) {
                Ok(port) => (port, PortSource::Fresh),
                Err(e) => {
                    self.stats.pool_exhausted.inc();
                    return Err(e);
                }
            }
        };

        let newly_bound = !table.port_in_use(port);
        let entry = MappingEntry {
            old_addr,
            old_port,
            dst_addr,
            new_port: port,
            last_touched: now,
        };
        if let Err(e) = table.insert(entry) {
            self.stats.allocation_failures.inc();
            return Err(e);
        }

        match source {
            PortSource::Reused => self.stats.reused.inc(),
            PortSource::Multiplexed => self.stats.multiplexed.inc(),
            PortSource::Fresh => {
                if newly_bound {
                    table.record_allocation(port);
                }
                self.stats.fresh.inc();
            }
        }
        self.stats.set_sizes(table.len(), table.allocated_ports());

        debug!(
            "New map {}:{} -> {} on port {}, {} flows, {} ports",
            old_addr,
            old_port,
            dst_addr,
            port,
            table.len(),
            table.allocated_ports()
        );

        Ok(port)
    }

    /// Original endpoint of an inbound flow
    ///
    /// Multiplexed ports are told apart by destination; a port known only
    /// for other destinations yields `NotFound`.
    pub fn resolve_inbound(
        &self,
        new_port: u16,
        dst_addr: Ipv4Addr,
    ) -> Result<(Ipv4Addr, u16), MapError> {
        let mut guard = self.lock();
        let now = self.clock.now();
        let table = &mut guard.table;
        self.evict(table, now);

        let hit = table
            .find_by_port(new_port)
            .find(|(_, entry)| entry.dst_addr == dst_addr)
            .map(|(id, entry)| (id, entry.old_addr, entry.old_port));

        match hit {
            Some((id, old_addr, old_port)) => {
                table.touch(id, now);
                self.stats.inbound_hits.inc();
                Ok((old_addr, old_port))
            }
            None => {
                self.stats.inbound_misses.inc();
                Err(MapError::NotFound)
            }
        }
    }

    /// Run the idle sweep outside of a query
    pub fn refresh(&self) -> usize {
        let mut guard = self.lock();
        let now = self.clock.now();
        self.evict(&mut guard.table, now)
    }

    /// Drop every entry (service stop)
    pub fn flush(&self) -> usize {
        let mut guard = self.lock();
        let removed = guard.table.clear();
        self.stats.set_sizes(0, 0);
        removed
    }

    fn evict(&self, table: &mut MappingTable, now: Instant) -> usize {
        let evicted = table.sweep(now);
        if evicted > 0 {
            self.stats.evicted.add(evicted as u64);
            self.stats.set_sizes(table.len(), table.allocated_ports());
        }
        evicted
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::clock::ManualClock;
    use std::sync::atomic::Ordering;

    fn list_with_clock(timeout: u64) -> (MapList, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let list = MapList::with_parts(
            MappingTable::new(Duration::from_secs(timeout)),
            clock.clone(),
            StdRng::seed_from_u64(42),
            Arc::new(TableStats::new()),
        );
        (list, clock)
    }

    #[test]
    fn test_exact_match_returns_same_port() {
        let (list, _) = list_with_clock(15);
        let ports = PortSet::new(2, 1024, 0);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(8, 8, 8, 8);

        let port = list.resolve_outbound(src, 5000, dst, &ports).unwrap();
        assert_eq!(list.resolve_outbound(src, 5000, dst, &ports), Ok(port));
        assert_eq!(list.len(), 1);
        assert_eq!(list.stats().outbound_hits.get(), 1);
        assert_eq!(list.stats().fresh.get(), 1);
    }

    #[test]
    fn test_reuse_does_not_allocate() {
        let (list, _) = list_with_clock(15);
        let ports = PortSet::new(2, 1024, 0);
        let src = Ipv4Addr::new(10, 0, 0, 1);

        let port = list
            .resolve_outbound(src, 5000, Ipv4Addr::new(8, 8, 8, 8), &ports)
            .unwrap();
        let again = list
            .resolve_outbound(src, 5000, Ipv4Addr::new(1, 1, 1, 1), &ports)
            .unwrap();

        assert_eq!(port, again);
        assert_eq!(list.len(), 2);
        assert_eq!(list.allocated_ports(), 1);
        assert_eq!(list.stats().reused.get(), 1);
    }

    #[test]
    fn test_inbound_round_trip_refreshes() {
        let (list, clock) = list_with_clock(15);
        let ports = PortSet::new(2, 1024, 0);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(8, 8, 8, 8);

        let port = list.resolve_outbound(src, 5000, dst, &ports).unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(list.resolve_inbound(port, dst), Ok((src, 5000)));

        // Refreshed at t=10, still alive at t=20
        clock.advance(Duration::from_secs(10));
        assert_eq!(list.resolve_inbound(port, dst), Ok((src, 5000)));
    }

    #[test]
    fn test_inbound_wrong_destination() {
        let (list, _) = list_with_clock(15);
        let ports = PortSet::new(2, 1024, 0);
        let port = list
            .resolve_outbound(
                Ipv4Addr::new(10, 0, 0, 1),
                5000,
                Ipv4Addr::new(8, 8, 8, 8),
                &ports,
            )
            .unwrap();

        assert_eq!(
            list.resolve_inbound(port, Ipv4Addr::new(9, 9, 9, 9)),
            Err(MapError::NotFound)
        );
        assert_eq!(list.stats().inbound_misses.get(), 1);
    }

    #[test]
    fn test_expiry_releases_port() {
        let (list, clock) = list_with_clock(15);
        let ports = PortSet::new(2, 1024, 0);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let port = list
            .resolve_outbound(Ipv4Addr::new(10, 0, 0, 1), 5000, dst, &ports)
            .unwrap();

        clock.advance(Duration::from_secs(15));
        assert_eq!(list.resolve_inbound(port, dst), Err(MapError::NotFound));
        assert_eq!(list.len(), 0);
        assert_eq!(list.allocated_ports(), 0);
        assert_eq!(list.stats().evicted.get(), 1);
    }

    #[test]
    fn test_refresh_sweeps_idle_entries() {
        let (list, clock) = list_with_clock(15);
        let ports = PortSet::new(2, 1024, 0);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        for i in 0..3 {
            list.resolve_outbound(Ipv4Addr::new(10, 0, 0, i), 5000, dst, &ports)
                .unwrap();
        }

        clock.advance(Duration::from_secs(14));
        assert_eq!(list.refresh(), 0);
        assert_eq!(list.len(), 3);

        clock.advance(Duration::from_secs(1));
        assert_eq!(list.refresh(), 3);
        assert!(list.is_empty());
        assert_eq!(list.allocated_ports(), 0);
        assert_eq!(list.stats().evicted.get(), 3);
        assert_eq!(list.stats().table_size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_entry_cap_leaves_table_unchanged() {
        let clock = Arc::new(ManualClock::new());
        let list = MapList::with_parts(
            MappingTable::new(Duration::from_secs(15)).with_max_entries(1),
            clock,
            StdRng::seed_from_u64(42),
            Arc::new(TableStats::new()),
        );
        let ports = PortSet::new(2, 1024, 0);
        let dst = Ipv4Addr::new(8, 8, 8, 8);

        let port = list
            .resolve_outbound(Ipv4Addr::new(10, 0, 0, 1), 5000, dst, &ports)
            .unwrap();
        assert_eq!(
            list.resolve_outbound(Ipv4Addr::new(10, 0, 0, 2), 5000, dst, &ports),
            Err(MapError::AllocationFailure)
        );

        assert_eq!(list.len(), 1);
        assert_eq!(list.allocated_ports(), 1);
        assert_eq!(list.stats().allocation_failures.get(), 1);
        assert_eq!(list.stats().fresh.get(), 1);
        assert_eq!(
            list.resolve_inbound(port, dst),
            Ok((Ipv4Addr::new(10, 0, 0, 1), 5000))
        );
    }

    #[test]
    fn test_flush() {
        let (list, _) = list_with_clock(15);
        let ports = PortSet::new(2, 1024, 0);
        for i in 0..5 {
            list.resolve_outbound(
                Ipv4Addr::new(10, 0, 0, i),
                5000,
                Ipv4Addr::new(8, 8, 8, 8),
                &ports,
            )
            .unwrap();
        }
        assert_eq!(list.flush(), 5);
        assert!(list.is_empty());
        assert_eq!(list.allocated_ports(), 0);
    }
}
