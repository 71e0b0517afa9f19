//! Address/port mapping core
//!
//! Assigns translated source ports to outbound flows from a PSID-partitioned
//! pool, remembers them for the reverse direction and expires idle flows.

mod allocator;
mod clock;
mod list;
mod portset;
mod service;
mod table;

pub use allocator::{allocate_fresh, find_multiplex_port, MULTIPLEX_ROUNDS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use list::MapList;
pub use portset::{PortSet, SYSTEM_PORT_LIMIT};
pub use service::{MapService, Protocol, ServiceSettings};
pub use table::{dest_bucket, EntryId, MappingEntry, MappingTable, DEST_BUCKETS};

/// Resolver failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("no free port left in the port set")]
    PoolExhausted,

    #[error("mapping entry could not be created")]
    AllocationFailure,

    #[error("no mapping for inbound flow")]
    NotFound,
}
