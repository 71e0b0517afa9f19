//! Configuration validation

use super::{Config, DEFAULT_ADJACENT, DEFAULT_RATIO, DEFAULT_TIMEOUT_SECS};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_port_set(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_logging(config, &mut result);

    result
}

fn validate_port_set(config: &Config, result: &mut ValidationResult) {
    let mapping = &config.mapping;

    if mapping.ratio.is_none() {
        result.warn(format!(
            "mapping.ratio not specified, using default {} (1:1 mode)",
            DEFAULT_RATIO
        ));
    }
    if mapping.adjacent.is_none() {
        result.warn(format!(
            "mapping.adjacent not specified, using default {}",
            DEFAULT_ADJACENT
        ));
    }

    let ratio = mapping.ratio.unwrap_or(DEFAULT_RATIO);
    let adjacent = mapping.adjacent.unwrap_or(DEFAULT_ADJACENT);
    let offset = mapping.offset.unwrap_or(0);

    // 0 stands for a single share / a single port per run
    if ratio != 0 && !ratio.is_power_of_two() {
        result.error(format!("mapping.ratio: {} is not a power of two", ratio));
    }
    if adjacent != 0 && !adjacent.is_power_of_two() {
        result.error(format!(
            "mapping.adjacent: {} is not a power of two",
            adjacent
        ));
    }
    if offset >= ratio.max(1) {
        result.error(format!(
            "mapping.offset: {} out of range for ratio {}",
            offset, ratio
        ));
    }
    if u32::from(ratio) * u32::from(adjacent) >= 1 << 16 {
        result.error(format!(
            "mapping: ratio {} x adjacent {} leaves no usable port",
            ratio, adjacent
        ));
    }
    if mapping.max_entries == Some(0) {
        result.error("mapping.max_entries must be greater than 0");
    }
}

fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
    let timeouts = &config.mapping.timeouts;
    for (name, value) in [("udp", timeouts.udp), ("icmp", timeouts.icmp)] {
        match value {
            None => result.warn(format!(
                "mapping.timeouts.{}: not specified, using default {}s",
                name, DEFAULT_TIMEOUT_SECS
            )),
            Some(0) => result.error(format!(
                "mapping.timeouts.{}: must be greater than 0",
                name
            )),
            Some(_) => {}
        }
    }
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    if let Some(level) = &config.logging.level {
        let known = ["error", "warn", "info", "debug", "trace"];
        if !known.contains(&level.to_lowercase().as_str()) {
            result.warn(format!("logging.level: unknown level '{}', using info", level));
        }
    }
    if let Some(format) = &config.logging.format {
        if !["pretty", "compact", "json"].contains(&format.as_str()) {
            result.warn(format!(
                "logging.format: unknown format '{}', using pretty",
                format
            ));
        }
    }
}
