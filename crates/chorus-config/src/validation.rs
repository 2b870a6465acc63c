//! Configuration validation.
//!
//! Validates numeric ranges and node entries, collecting all errors
//! into a single ValidationError.

use chorus_common::ConfigError;

use crate::schema::ChorusConfig;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &ChorusConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    if config.manager.shard_count == 0 {
        errors.push("manager.shard_count must be >= 1".into());
    }
    validate_range(
        &mut errors,
        "manager.handshake_timeout_ms",
        config.manager.handshake_timeout_ms,
        1_000,
        60_000,
    );

    if config.pool.failover_limit == 0 {
        errors.push("pool.failover_limit must be >= 1".into());
    }
    validate_range(
        &mut errors,
        "pool.failover_rate_ms",
        config.pool.failover_rate_ms,
        10,
        60_000,
    );

    let mut seen_keys = std::collections::HashSet::new();
    for (i, node) in config.nodes.iter().enumerate() {
        if node.host.is_empty() {
            errors.push(format!("nodes[{i}].host must not be empty"));
        }
        if node.port == 0 {
            errors.push(format!("nodes[{i}].port must not be zero"));
        }
        let key = format!("{}:{}", node.host, node.port);
        if !seen_keys.insert(key.clone()) {
            errors.push(format!("duplicate node entry {key}"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

fn validate_range<T: PartialOrd + std::fmt::Display>(
    errors: &mut Vec<String>,
    field: &str,
    value: T,
    min: T,
    max: T,
) {
    if value < min || value > max {
        errors.push(format!("{field} must be between {min} and {max}, got {value}"));
    }
}
