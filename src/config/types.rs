//! Configuration types

use crate::mapping::{PortSet, ServiceSettings};
use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub const DEFAULT_RATIO: u16 = 1;
pub const DEFAULT_ADJACENT: u16 = 1024;
pub const DEFAULT_OFFSET: u16 = 0;
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingConfig {
    /// Number of shares the port space is split into
    pub ratio: Option<u16>,
    /// Length of a contiguous port run
    pub adjacent: Option<u16>,
    /// Share owned by this instance
    pub offset: Option<u16>,
    pub max_entries: Option<usize>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Idle timeouts in seconds
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutConfig {
    pub udp: Option<u64>,
    pub icmp: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

// ============================================================================
// Lock file types (generated, includes all defaults)
// ============================================================================

/// Generated lock file with all defaults filled in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLock {
    pub generated_at: String,
    pub source_hash: String,
    pub mapping: MappingLock,
    pub logging: LoggingLock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingLock {
    pub ratio: u16,
    pub adjacent: u16,
    pub offset: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    pub timeouts: TimeoutLock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutLock {
    pub udp: u64,
    pub icmp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingLock {
    pub level: String,
    pub format: String,
}

impl ConfigLock {
    pub fn from_config(config: &Config, source: &str) -> Self {
        let mapping = &config.mapping;
        let mapping = MappingLock {
            ratio: mapping.ratio.unwrap_or(DEFAULT_RATIO),
            adjacent: mapping.adjacent.unwrap_or(DEFAULT_ADJACENT),
            offset: mapping.offset.unwrap_or(DEFAULT_OFFSET),
            max_entries: mapping.max_entries,
            timeouts: TimeoutLock {
                udp: mapping.timeouts.udp.unwrap_or(DEFAULT_TIMEOUT_SECS),
                icmp: mapping.timeouts.icmp.unwrap_or(DEFAULT_TIMEOUT_SECS),
            },
        };

        let logging = LoggingLock {
            level: config
                .logging
                .level
                .clone()
                .unwrap_or_else(|| "info".to_string()),
            format: config
                .logging
                .format
                .clone()
                .unwrap_or_else(|| "pretty".to_string()),
        };

        ConfigLock {
            generated_at: chrono::Utc::now().to_rfc3339(),
            source_hash: source_hash(source),
            mapping,
            logging,
        }
    }
}

impl MappingLock {
    pub fn port_set(&self) -> PortSet {
        PortSet::new(self.ratio, self.adjacent, self.offset)
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            ports: self.port_set(),
            udp_timeout: Duration::from_secs(self.timeouts.udp),
            icmp_timeout: Duration::from_secs(self.timeouts.icmp),
            max_entries: self.max_entries,
        }
    }
}

impl LoggingLock {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level.clone(),
            format: self.format.clone(),
        }
    }
}

fn source_hash(source: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
