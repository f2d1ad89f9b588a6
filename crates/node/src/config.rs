//! Configuration management for the PeerLink node.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/peerlink/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::config::{ConnectionConfig, AUTO_ROUTING, ENABLED, TRAFFIC_FORWARDING};
use protocol::framing::{DEFAULT_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_BODY_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::connection::{ConnectionSettings, DEFAULT_LINK_MTU};
use crate::network::keepalive::{
    KeepaliveSettings, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_MISSED, MIN_KEEPALIVE_INTERVAL,
};

/// Environment variable overriding `network.listen_addr`.
pub const ENV_LISTEN_ADDR: &str = "PEERLINK_LISTEN_ADDR";

/// Environment variable overriding `node.log_level`.
pub const ENV_LOG_LEVEL: &str = "PEERLINK_LOG_LEVEL";

/// Smallest link MTU that still leaves room for a QUIC payload.
const MIN_LINK_MTU: u16 = 1280;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("listen_addr must be an IP address with port, got {0}")]
    InvalidListenAddr(String),

    #[error("server_name must not be empty")]
    EmptyServerName,

    #[error("frame_size must be between {min} and {max} bytes, got {size}")]
    InvalidFrameSize { size: usize, min: usize, max: usize },

    #[error("link_mtu must be at least {min}, got {mtu}")]
    InvalidLinkMtu { mtu: u16, min: u16 },

    #[error("keepalive interval_secs must be greater than 0")]
    InvalidKeepaliveInterval,

    #[error("keepalive min_interval_ms must be greater than 0 and below the interval, got {0}")]
    InvalidKeepaliveMinInterval(u64),

    #[error("keepalive max_missed must be greater than 0")]
    InvalidMaxMissed,

    #[error("invalid feature flag: {0}")]
    InvalidFeature(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for a PeerLink node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General node configuration.
    pub node: NodeConfig,

    /// Listener and transport configuration.
    pub network: NetworkConfig,

    /// Liveness probing.
    pub keepalive: KeepaliveConfig,

    /// Features offered to peers during config negotiation.
    pub features: FeaturesConfig,
}

/// General node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory for the identity key and development certificate.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listener binds to.
    pub listen_addr: String,

    /// Name in the self-signed development certificate.
    pub server_name: String,

    /// Frame size on the control and traffic streams, header included.
    pub frame_size: usize,

    /// Link MTU used to compute the announced QUIC payload size.
    pub link_mtu: u16,

    /// Use the unreliable datagram channel when the peer supports it.
    pub enable_datagrams: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Interval between challenges while the peer answers.
    pub interval_secs: u64,

    /// Floor for the halved interval after missed replies.
    pub min_interval_ms: u64,

    /// Consecutive misses before the connection is closed.
    pub max_missed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FeaturesConfig {
    pub auto_routing: bool,
    pub traffic_forwarding: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4433".to_string(),
            server_name: "localhost".to_string(),
            frame_size: DEFAULT_FRAME_SIZE,
            link_mtu: DEFAULT_LINK_MTU,
            enable_datagrams: true,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
            min_interval_ms: MIN_KEEPALIVE_INTERVAL.as_millis() as u64,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerlink")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerlink")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PEERLINK_LISTEN_ADDR: Override the listener address
    /// - PEERLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(ENV_LISTEN_ADDR) {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.network.listen_addr = addr;
            }
        }

        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        self.listen_socket_addr()?;

        if self.network.server_name.trim().is_empty() {
            return Err(ConfigError::EmptyServerName);
        }

        let min_frame = FRAME_HEADER_SIZE + 1;
        let max_frame = FRAME_HEADER_SIZE + MAX_FRAME_BODY_SIZE;
        let frame_size = self.network.frame_size;
        if !(min_frame..=max_frame).contains(&frame_size) {
            return Err(ConfigError::InvalidFrameSize {
                size: frame_size,
                min: min_frame,
                max: max_frame,
            });
        }

        if self.network.link_mtu < MIN_LINK_MTU {
            return Err(ConfigError::InvalidLinkMtu {
                mtu: self.network.link_mtu,
                min: MIN_LINK_MTU,
            });
        }

        let keepalive = &self.keepalive;
        if keepalive.interval_secs == 0 {
            return Err(ConfigError::InvalidKeepaliveInterval);
        }
        if keepalive.min_interval_ms == 0
            || keepalive.min_interval_ms >= keepalive.interval_secs.saturating_mul(1000)
        {
            return Err(ConfigError::InvalidKeepaliveMinInterval(
                keepalive.min_interval_ms,
            ));
        }
        if keepalive.max_missed == 0 {
            return Err(ConfigError::InvalidMaxMissed);
        }

        Ok(())
    }

    /// The listener address as a socket address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.network
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.network.listen_addr.clone()))
    }

    /// Path of the persisted node identity.
    pub fn identity_path(&self) -> PathBuf {
        self.node.data_dir.join("identity.key")
    }

    /// Path the development certificate is written to.
    pub fn cert_path(&self) -> PathBuf {
        self.node.data_dir.join("cert.der")
    }

    /// Features offered to peers.
    pub fn offered_features(&self) -> Result<ConnectionConfig, ConfigError> {
        let mut offered = ConnectionConfig::new();
        let flags = [
            (AUTO_ROUTING, self.features.auto_routing),
            (TRAFFIC_FORWARDING, self.features.traffic_forwarding),
        ];
        for (name, enabled) in flags {
            if enabled {
                offered
                    .add(name, ENABLED)
                    .map_err(|e| ConfigError::InvalidFeature(e.to_string()))?;
            }
        }
        Ok(offered)
    }

    /// Build the runtime connection settings.
    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        self.validate()?;
        Ok(ConnectionSettings {
            config: self.offered_features()?,
            frame_size: self.network.frame_size,
            link_mtu: self.network.link_mtu,
            enable_datagrams: self.network.enable_datagrams,
            keepalive: KeepaliveSettings {
                interval: Duration::from_secs(self.keepalive.interval_secs),
                min_interval: Duration::from_millis(self.keepalive.min_interval_ms),
                max_missed: self.keepalive.max_missed,
            },
            ..ConnectionSettings::default()
        })
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.node.log_level, "info");
        assert!(config.node.data_dir.to_string_lossy().contains("peerlink"));
        assert_eq!(config.network.listen_addr, "0.0.0.0:4433");
        assert_eq!(config.network.frame_size, DEFAULT_FRAME_SIZE);
        assert!(config.network.enable_datagrams);
        assert_eq!(config.keepalive.interval_secs, 12);
        assert_eq!(config.keepalive.min_interval_ms, 500);
        assert_eq!(config.keepalive.max_missed, 3);
        assert!(!config.features.auto_routing);
        assert!(!config.features.traffic_forwarding);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[node]
log_level = "debug"

[keepalive]
interval_secs = 30
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.log_level, "debug");
        assert_eq!(config.keepalive.interval_secs, 30);
        assert_eq!(config.keepalive.max_missed, 3);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[node]
data_dir = "/custom/data"
log_level = "trace"

[network]
listen_addr = "[::]:9000"
server_name = "node.example.com"
frame_size = 4096
link_mtu = 9000
enable_datagrams = false

[keepalive]
interval_secs = 5
min_interval_ms = 250
max_missed = 5

[features]
auto_routing = true
traffic_forwarding = true
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.network.listen_addr, "[::]:9000");
        assert_eq!(config.network.server_name, "node.example.com");
        assert_eq!(config.network.frame_size, 4096);
        assert_eq!(config.network.link_mtu, 9000);
        assert!(!config.network.enable_datagrams);
        assert_eq!(config.keepalive.min_interval_ms, 250);
        assert!(config.features.auto_routing);
        assert!(config.validate().is_ok());
        assert_eq!(config.identity_path(), PathBuf::from("/custom/data/identity.key"));
        assert_eq!(config.cert_path(), PathBuf::from("/custom/data/cert.der"));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[node\nlog_level = \"debug\"\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
frame_size = "large"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[node]
log_level = "warn"
colour = "blue"

[telemetry]
enabled = true
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.node.log_level, "warn");
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.node.log_level = "warn".to_string();
        original.network.frame_size = 2048;
        original.keepalive.max_missed = 7;
        original.features.traffic_forwarding = true;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[keepalive]"));
        assert!(toml.contains("[features]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.network.listen_addr = "127.0.0.1:5000".to_string();

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("peerlink"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.node.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.node.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = Config::default();
        config.network.listen_addr = "example.com:4433".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("example.com:4433".to_string()))
        );

        config.network.listen_addr = "[::1]:0".to_string();
        assert_eq!(config.listen_socket_addr().unwrap(), "[::1]:0".parse().unwrap());
    }

    #[test]
    fn test_validate_frame_size_bounds() {
        let mut config = Config::default();

        config.network.frame_size = FRAME_HEADER_SIZE;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFrameSize { size, .. }) if size == FRAME_HEADER_SIZE
        ));

        config.network.frame_size = FRAME_HEADER_SIZE + 1;
        assert!(config.validate().is_ok());

        config.network.frame_size = FRAME_HEADER_SIZE + MAX_FRAME_BODY_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_keepalive() {
        let mut config = Config::default();
        config.keepalive.interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKeepaliveInterval));

        let mut config = Config::default();
        config.keepalive.min_interval_ms = 12_000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidKeepaliveMinInterval(12_000))
        );

        let mut config = Config::default();
        config.keepalive.max_missed = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxMissed));
    }

    #[test]
    fn test_validate_server_name_and_mtu() {
        let mut config = Config::default();
        config.network.server_name = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyServerName));

        let mut config = Config::default();
        config.network.link_mtu = 576;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLinkMtu { mtu: 576, min: 1280 })
        );
    }

    #[test]
    fn test_connection_settings() {
        let mut config = Config::default();
        config.network.frame_size = 2048;
        config.network.enable_datagrams = false;
        config.keepalive.interval_secs = 4;
        config.keepalive.min_interval_ms = 100;
        config.features.auto_routing = true;

        let settings = config.connection_settings().unwrap();
        assert_eq!(settings.frame_size, 2048);
        assert!(!settings.enable_datagrams);
        assert_eq!(settings.keepalive.interval, Duration::from_secs(4));
        assert_eq!(settings.keepalive.min_interval, Duration::from_millis(100));
        assert!(settings.config.auto_routing());
        assert!(!settings.config.traffic_forwarding());
        assert_eq!(settings.config.to_string(), "<auto-routing=yes>");
    }

    #[test]
    fn test_connection_settings_rejects_invalid_config() {
        let mut config = Config::default();
        config.keepalive.max_missed = 0;
        assert!(config.connection_settings().is_err());
    }

    #[test]
    #[serial]
    fn test_env_override_listen_addr() {
        std::env::set_var(ENV_LISTEN_ADDR, "127.0.0.1:7000");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.listen_addr, "127.0.0.1:7000");

        std::env::remove_var(ENV_LISTEN_ADDR);
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var(ENV_LOG_LEVEL, "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.node.log_level, "trace");

        std::env::remove_var(ENV_LOG_LEVEL);
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var(ENV_LISTEN_ADDR, "");
        std::env::set_var(ENV_LOG_LEVEL, "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var(ENV_LISTEN_ADDR);
        std::env::remove_var(ENV_LOG_LEVEL);
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var(ENV_LISTEN_ADDR);
        std::env::remove_var(ENV_LOG_LEVEL);

        let mut config = Config::default();
        config.node.log_level = "error".to_string();
        config.apply_env_overrides();
        assert_eq!(config.node.log_level, "error");
        assert_eq!(config.network.listen_addr, "0.0.0.0:4433");
    }
}
