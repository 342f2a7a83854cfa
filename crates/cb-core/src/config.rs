//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Host key verification policy for outbound SSH connections.
///
/// The engine historically accepted whatever key the host presented. That
/// stays the default so existing setups keep working, but it is a real
/// security gap; deployments that care should pin fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept any host key; each acceptance is logged as a warning
    TrustAny,
    /// Accept only keys whose fingerprint appears in the list
    Pinned {
        /// Allowed fingerprints, as logged during connection attempts
        fingerprints: Vec<String>,
    },
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        Self::TrustAny
    }
}

/// Configuration for the deployment engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TCP connect and SSH handshake timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Upper bound for one auxiliary command on an ephemeral channel
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Host key verification policy
    pub host_key_policy: HostKeyPolicy,

    /// Terminal type requested for the primary channel
    pub terminal: String,

    /// Primary pty width in columns
    pub pty_cols: u32,

    /// Primary pty height in rows
    pub pty_rows: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(120),
            host_key_policy: HostKeyPolicy::default(),
            terminal: "xterm".to_string(),
            pty_cols: 80,
            pty_rows: 24,
        }
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudbox")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("engine.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Serialize `Duration` fields as whole seconds, the readable form in TOML.
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_preserve_original_behavior() {
        let config = EngineConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.host_key_policy, HostKeyPolicy::TrustAny);
        assert_eq!(config.terminal, "xterm");
        assert_eq!((config.pty_cols, config.pty_rows), (80, 24));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig = toml::from_str("connect_timeout = 10").unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Duration::from_secs(120));
        assert_eq!(config.host_key_policy, HostKeyPolicy::TrustAny);
    }

    #[test]
    fn test_pinned_policy_parses() {
        let config: EngineConfig = toml::from_str(
            r#"
            [host_key_policy]
            mode = "pinned"
            fingerprints = ["SHA256:abc123"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.host_key_policy,
            HostKeyPolicy::Pinned {
                fingerprints: vec!["SHA256:abc123".to_string()],
            }
        );
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");

        let mut config = EngineConfig::default();
        config.command_timeout = Duration::from_secs(45);
        config.host_key_policy = HostKeyPolicy::Pinned {
            fingerprints: vec!["SHA256:abc123".to_string()],
        };

        save_config(&path, &config).unwrap();
        let loaded: EngineConfig = load_config(&path).unwrap();

        assert_eq!(loaded.command_timeout, Duration::from_secs(45));
        assert_eq!(loaded.host_key_policy, config.host_key_policy);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config::<EngineConfig>(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
