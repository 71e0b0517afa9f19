//! Metrics collection for mapping tables.
//!
//! Provides thread-safe counters for tracking resolver outcomes
//! per protocol table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-table statistics.
#[derive(Debug, Default)]
pub struct TableStats {
    /// Outbound lookups answered by an existing flow.
    pub outbound_hits: Counter,
    /// New flows that reused their source endpoint's port.
    pub reused: Counter,
    /// New flows that borrowed a port bound to another destination.
    pub multiplexed: Counter,
    /// New flows that took a fresh port from the pool.
    pub fresh: Counter,
    /// Outbound lookups that found no free port.
    pub pool_exhausted: Counter,
    /// Outbound lookups whose entry could not be created.
    pub allocation_failures: Counter,
    /// Inbound lookups that found their flow.
    pub inbound_hits: Counter,
    /// Inbound lookups without a matching flow.
    pub inbound_misses: Counter,
    /// Entries removed by the idle sweep.
    pub evicted: Counter,

    /// Current number of entries.
    pub table_size: AtomicU64,
    /// Current number of distinct translated ports.
    pub allocated_ports: AtomicU64,
}

impl TableStats {
    /// Creates new table statistics initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the size gauges.
    pub fn set_sizes(&self, entries: usize, ports: usize) {
        self.table_size.store(entries as u64, Ordering::Relaxed);
        self.allocated_ports.store(ports as u64, Ordering::Relaxed);
    }

    fn export_into(&self, prefix: &str, out: &mut Vec<(String, u64)>) {
        out.extend([
            (format!("{}_outbound_hits", prefix), self.outbound_hits.get()),
            (format!("{}_reused", prefix), self.reused.get()),
            (format!("{}_multiplexed", prefix), self.multiplexed.get()),
            (format!("{}_fresh", prefix), self.fresh.get()),
            (format!("{}_pool_exhausted", prefix), self.pool_exhausted.get()),
            (
                format!("{}_allocation_failures", prefix),
                self.allocation_failures.get(),
            ),
            (format!("{}_inbound_hits", prefix), self.inbound_hits.get()),
            (format!("{}_inbound_misses", prefix), self.inbound_misses.get()),
            (format!("{}_evicted", prefix), self.evicted.get()),
            (
                format!("{}_table_size", prefix),
                self.table_size.load(Ordering::Relaxed),
            ),
            (
                format!("{}_allocated_ports", prefix),
                self.allocated_ports.load(Ordering::Relaxed),
            ),
        ]);
    }
}

/// Metrics registry shared by all tables of a service.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    tables: RwLock<HashMap<String, Arc<TableStats>>>,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table and returns its statistics handle.
    ///
    /// Registering the same name twice returns the existing handle.
    pub fn register_table(&self, name: &str) -> Arc<TableStats> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.entry(name.to_string()).or_default().clone()
    }

    /// Exports all metrics as key-value pairs, sorted by name.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = Vec::new();
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        for (name, stats) in tables.iter() {
            stats.export_into(name, &mut result);
        }
        result.sort();
        result
    }
}
