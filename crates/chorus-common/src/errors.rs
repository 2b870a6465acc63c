use std::path::PathBuf;

use crate::id::GroupId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No connected, non-draining node could serve the request.
    #[error("no available voice node{}", match .region {
        Some(r) => format!(" for region {r}"),
        None => String::new(),
    })]
    NoAvailableNode { region: Option<String> },

    /// No voice-server signal arrived within the handshake window.
    #[error("voice handshake timed out for group {0}")]
    HandshakeTimeout(GroupId),

    /// The session was torn down before the operation completed.
    #[error("session disconnected: {0}")]
    Disconnected(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("node error: {0}")]
    Node(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert_eq!(err.to_string(), "config file not found: /tmp/missing.toml");

        let err = ConfigError::ParseError("unexpected token".into());
        assert_eq!(err.to_string(), "config parse error: unexpected token");

        let err = ConfigError::ValidationError("pool.failover_limit must be >= 1".into());
        assert_eq!(
            err.to_string(),
            "config validation error: pool.failover_limit must be >= 1"
        );
    }

    #[test]
    fn no_available_node_display() {
        let err = VoiceError::NoAvailableNode {
            region: Some("eu".into()),
        };
        assert_eq!(err.to_string(), "no available voice node for region eu");

        let err = VoiceError::NoAvailableNode { region: None };
        assert_eq!(err.to_string(), "no available voice node");
    }

    #[test]
    fn handshake_timeout_display() {
        let err = VoiceError::HandshakeTimeout(GroupId::from("g1"));
        assert_eq!(err.to_string(), "voice handshake timed out for group g1");
    }

    #[test]
    fn voice_error_from_config() {
        let config_err = ConfigError::ParseError("bad toml".into());
        let err: VoiceError = config_err.into();
        assert!(matches!(err, VoiceError::Config(_)));
        assert!(err.to_string().contains("bad toml"));
    }

    #[test]
    fn voice_error_from_serde() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: VoiceError = json_err.into();
        assert!(matches!(err, VoiceError::Serialization(_)));
    }
}
