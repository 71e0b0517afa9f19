//! psidmap - port-mapping core of a stateless MAP-T/MAP-E translator
//!
//! Assigns translated ports from a PSID-partitioned, shared pool to outbound
//! flows, resolves inbound traffic back to the original endpoint and expires
//! idle flows. Packet rewriting happens elsewhere; this crate only answers
//! the two lookups.

pub mod config;
pub mod error;
pub mod mapping;
pub mod telemetry;

pub use error::{Error, Result};
