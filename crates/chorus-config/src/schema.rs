//! Configuration schema for chorus.
//!
//! All structs use `serde(default)` so partial configs work correctly.
//! Missing fields are filled with defaults matching a single local node.

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Manager Config
// =============================================================================

/// Session manager behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Bot identity sent in the `User-Id` header on node sockets.
    pub user_id: String,
    /// Shard count sent in the `Num-Shards` header on node sockets.
    pub shard_count: u32,
    /// How long a join handshake may wait for a voice-server signal (ms).
    pub handshake_timeout_ms: u64,
    /// Added to the last known position when resuming after failover (ms).
    pub resume_offset_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            shard_count: 1,
            handshake_timeout_ms: 10_000,
            resume_offset_ms: 2_000,
        }
    }
}

// =============================================================================
// Pool Config
// =============================================================================

/// Node pool and failover pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Length of one failover window in milliseconds.
    pub failover_rate_ms: u64,
    /// Maximum re-homing jobs executed per window.
    pub failover_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failover_rate_ms: 250,
            failover_limit: 1,
        }
    }
}

// =============================================================================
// Node Config
// =============================================================================

/// One backend audio node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// Credential sent in the `Authorization` header.
    pub password: String,
    /// Region hint used by node selection; optional.
    pub region: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 2333,
            password: String::new(),
            region: None,
        }
    }
}

// =============================================================================
// Root Config
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    pub manager: ManagerConfig,
    pub pool: PoolConfig,
    pub nodes: Vec<NodeConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ChorusConfig::default();
        assert_eq!(config.manager.handshake_timeout_ms, 10_000);
        assert_eq!(config.manager.shard_count, 1);
        assert_eq!(config.pool.failover_rate_ms, 250);
        assert_eq!(config.pool.failover_limit, 1);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
            [manager]
            user_id = "1234"

            [[nodes]]
            host = "voice-eu-1"
            password = "s3cret"
            region = "eu"
        "#;
        let config: ChorusConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.manager.user_id, "1234");
        assert_eq!(config.manager.handshake_timeout_ms, 10_000);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].host, "voice-eu-1");
        assert_eq!(config.nodes[0].port, 2333);
        assert_eq!(config.nodes[0].region.as_deref(), Some("eu"));
    }
}
