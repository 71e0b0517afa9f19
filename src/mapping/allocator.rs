//! Port selection for new outbound flows
//!
//! Two strategies, tried in order by the resolver after exact match and
//! endpoint reuse have missed:
//! 1. multiplex: borrow a port already bound to some other destination,
//!    found by a randomized walk over the destination buckets
//! 2. fresh: a circular rover over the groups of the caller's port set

use super::portset::PortSet;
use super::table::{dest_bucket, MappingTable, DEST_BUCKETS};
use super::MapError;
use rand::Rng;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Non-empty buckets that may fail to yield a port before the multiplex
/// search gives up
pub const MULTIPLEX_ROUNDS: usize = 3;

/// Find a port already in use that can also carry traffic to `dst_addr`
///
/// Starts at a random bucket other than the destination's own and walks
/// the remaining `DEST_BUCKETS - 1` buckets once. Entries in another bucket
/// never target `dst_addr`, but their port may still be bound to it through
/// a third entry, so every candidate is checked against the destination.
pub fn find_multiplex_port<R: Rng>(
    table: &MappingTable,
    dst_addr: Ipv4Addr,
    ports: &PortSet,
    rng: &mut R,
) -> Option<u16> {
    if table.is_empty() {
        return None;
    }

    let home = dest_bucket(dst_addr);
    let spin = rng.random_range(1..DEST_BUCKETS);
    let mut chances = MULTIPLEX_ROUNDS;

    for visit in 0..DEST_BUCKETS - 1 {
        if chances == 0 {
            break;
        }
        let step = (spin - 1 + visit) % (DEST_BUCKETS - 1) + 1;
        let bucket = (home + step) & (DEST_BUCKETS - 1);

        let mut candidates = table.bucket(bucket).peekable();
        if candidates.peek().is_none() {
            continue;
        }
        for (_, entry) in candidates {
            let port = entry.new_port;
            if ports.contains(port) && !table.port_bound_to(port, dst_addr) {
                debug!(
                    "Multiplexing port {} toward {} (bucket {}, visit {})",
                    port,
                    dst_addr,
                    bucket,
                    visit + 1
                );
                return Some(port);
            }
        }
        chances -= 1;
    }

    None
}

/// Pick a port nobody holds yet
///
/// In 1:1 mode the original port is used as is, provided it is not
/// already bound to the same destination. Otherwise the rover resumes
/// after the last allocated port and walks run positions, then groups,
/// wrapping from `high` back to `low`.
pub fn allocate_fresh(
    table: &MappingTable,
    old_port: u16,
    dst_addr: Ipv4Addr,
    ports: &PortSet,
) -> Result<u16, MapError> {
    if table.allocated_ports() >= ports.capacity() {
        info!(
            "Port pool full ({} of {} ports allocated)",
            table.allocated_ports(),
            ports.capacity()
        );
        return Err(MapError::PoolExhausted);
    }

    if ports.is_one_to_one() {
        if old_port == 0 || table.port_bound_to(old_port, dst_addr) {
            return Err(MapError::PoolExhausted);
        }
        return Ok(old_port);
    }

    let (low, high) = ports.group_range().ok_or(MapError::PoolExhausted)?;
    let run = ports.run_len();

    let (mut group, mut k) = match table.last_allocated_port() {
        0 => (low, 0),
        last => {
            let mut group = ports.group_of(last);
            let mut k = (u32::from(last) & (run - 1)) + 1;
            if k == run {
                group += 1;
                k = 0;
            }
            if group < low || group > high {
                group = low;
            }
            (group, k)
        }
    };

    // Every (group, k) position is examined exactly once, wrapping back
    // to the part of the starting group that precedes the cursor.
    let mut remaining = u64::from(high - low + 1) * u64::from(run);
    while remaining > 0 {
        let port = ports.port(group, k);
        if port != 0 && !table.port_in_use(port) {
            return Ok(port);
        }
        remaining -= 1;

        k += 1;
        if k == run {
            k = 0;
            group += 1;
            if group > high {
                group = low;
            }
        }
    }

    debug!("No free port left in groups {}..={}", low, high);
    Err(MapError::PoolExhausted)
}
