//! TOML config file loading and creation.

use std::path::Path;

use chorus_common::ConfigError;
use tracing::{info, warn};

use crate::schema::ChorusConfig;
use crate::validation;

/// Load config from a specific TOML file path.
///
/// Deserializes the file using serde defaults for any missing fields.
/// After loading, the config is validated; if validation fails, a warning
/// is logged and the default config is returned.
pub fn load_from_path(path: &Path) -> Result<ChorusConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::ParseError(format!("failed to read {}: {e}", path.display()))
    })?;

    let config: ChorusConfig = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("failed to parse TOML: {e}")))?;

    // Validate and warn on errors, but still return something usable
    if let Err(e) = validation::validate(&config) {
        warn!("config validation warning: {e}");
        warn!("falling back to default config");
        return Ok(ChorusConfig::default());
    }

    info!("loaded config from {}", path.display());
    Ok(config)
}

/// Load config from the platform-specific default path.
///
/// On macOS: `~/Library/Application Support/chorus/config.toml`
/// On Linux: `~/.config/chorus/config.toml`
///
/// If the file does not exist, creates a default config file and returns defaults.
pub fn load_default() -> Result<ChorusConfig, ConfigError> {
    let path = default_config_path()?;

    if !path.exists() {
        info!("no config found at {}, creating default", path.display());
        create_default_config(&path)?;
        return Ok(ChorusConfig::default());
    }

    load_from_path(&path)
}

/// Get the platform-specific default config file path.
pub fn default_config_path() -> Result<std::path::PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::ParseError("could not determine config directory".into())
    })?;
    Ok(config_dir.join("chorus").join("config.toml"))
}

/// Create a default TOML config file with documentation comments.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConfigError::ParseError(format!(
                "failed to create config directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let content = default_config_toml();

    std::fs::write(path, content).map_err(|e| {
        ConfigError::ParseError(format!(
            "failed to write default config to {}: {e}",
            path.display()
        ))
    })?;

    info!("created default config at {}", path.display());
    Ok(())
}

/// Generate the default TOML config content with comments.
fn default_config_toml() -> String {
    r##"# Chorus Configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[manager]
# user_id = ""               # bot identity (User-Id header)
# shard_count = 1            # Num-Shards header
# handshake_timeout_ms = 10000   # 1000-60000
# resume_offset_ms = 2000    # added to position when resuming after failover

[pool]
# failover_rate_ms = 250     # 10-60000, one re-homing window
# failover_limit = 1         # jobs per window

# [[nodes]]
# host = "localhost"
# port = 2333
# password = "youshallnotpass"
# region = "eu"
"##
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let err = load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn load_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
            [manager]
            user_id = "42"
            shard_count = 2

            [[nodes]]
            host = "voice-us-1"
            port = 8080
            password = "pw"
            region = "us"
            "#
        )
        .unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.manager.user_id, "42");
        assert_eq!(config.manager.shard_count, 2);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].port, 8080);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pool]\nfailover_limit = 0\n").unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.pool.failover_limit, 1);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[manager\nuser_id =").unwrap();

        let err = load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn default_config_template_parses() {
        let config: ChorusConfig = toml::from_str(&default_config_toml()).unwrap();
        assert!(crate::validation::validate(&config).is_ok());
    }

    #[test]
    fn create_default_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        create_default_config(&path).unwrap();
        assert!(path.exists());
        let config = load_from_path(&path).unwrap();
        assert_eq!(config.pool.failover_rate_ms, 250);
    }
}
