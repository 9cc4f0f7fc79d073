//! Configuration management for the overlay messenger.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "messenger.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESSENGER";

/// Complete configuration for a messenger node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Local identity
    pub identity: IdentityConfig,
    /// Socket and addressing
    pub network: NetworkConfig,
    /// LAN beacon and liveness
    pub discovery: DiscoveryConfig,
    /// STUN and DHT rendezvous
    pub rendezvous: RendezvousConfig,
    /// Session key delivery
    pub handshake: HandshakeConfig,
    /// Hole punch SYN rounds
    pub hole_punch: HolePunchConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// How peers find each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// LAN broadcast discovery on a fixed port range
    Local,
    /// STUN + DHT rendezvous on an ephemeral port
    Internet,
}

impl std::str::FromStr for NetworkMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "lan" => Ok(Self::Local),
            "internet" | "wan" => Ok(Self::Internet),
            other => Err(ConfigError::InvalidValue {
                field: "network.mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Username announced to peers; also the DHT key
    pub username: String,
    /// RSA modulus size
    pub rsa_key_bits: usize,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Discovery mode
    pub mode: NetworkMode,
    /// First port tried in local mode
    pub base_port: u16,
    /// Number of ports tried (and broadcast to) starting at `base_port`
    pub port_range: u16,
    /// Target for discovery beacons
    pub broadcast_address: IpAddr,
    /// Largest datagram the listener accepts
    pub max_datagram_size: usize,
}

/// LAN discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Interval between discovery broadcasts
    pub beacon_interval_ms: u64,
    /// A peer silent for longer than this is pruned
    pub liveness_timeout_ms: u64,
    /// Interval between liveness sweeps
    pub sweep_interval_ms: u64,
}

/// Internet rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Query a STUN server for our public address at startup
    pub enable_stun: bool,
    /// STUN server as `host:port`
    pub stun_server: String,
    /// STUN response timeout
    pub stun_timeout_ms: u64,
    /// Join the Kademlia DHT (otherwise an in-process directory is used)
    pub enable_dht: bool,
    /// TCP port for the DHT swarm (0 = ephemeral)
    pub dht_listen_port: u16,
    /// Bootstrap multiaddrs, each ending in `/p2p/<peer id>`
    pub bootstrap_nodes: Vec<String>,
    /// Interval between republishing our own record
    pub republish_interval_secs: u64,
}

/// Session key delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// How many times a session key is sent before giving up
    pub max_attempts: u32,
    /// Delay between session key retransmissions
    pub retry_interval_ms: u64,
}

/// Hole punch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Number of SYN rounds
    pub attempts: u32,
    /// Delay between rounds
    pub interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            rsa_key_bits: crate::defaults::RSA_KEY_BITS,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Local,
            base_port: crate::defaults::BASE_PORT,
            port_range: crate::defaults::PORT_RANGE,
            broadcast_address: IpAddr::from([255, 255, 255, 255]),
            max_datagram_size: crate::defaults::MAX_DATAGRAM_SIZE,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: 5_000,
            liveness_timeout_ms: 12_000,
            sweep_interval_ms: 15_000,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            enable_stun: true,
            stun_server: crate::defaults::STUN_SERVER.to_string(),
            stun_timeout_ms: 3_000,
            enable_dht: true,
            dht_listen_port: 0,
            bootstrap_nodes: Vec::new(),
            republish_interval_secs: 60,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_interval_ms: 1_000,
        }
    }
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Beacon cadence
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    /// Liveness threshold
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Sweep cadence
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl HandshakeConfig {
    /// Delay between session key retransmissions
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl HolePunchConfig {
    /// Delay between SYN rounds
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// The username may legitimately be missing here when the caller supplies
    /// it afterwards (for example from the command line), so validation is
    /// left to the caller.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            } else {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("overlay-messenger")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|p| p.exists()) {
                config = config.merge(Self::from_file(location)?);
            }
        }

        config.merge_from_env()
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other.
    ///
    /// An empty username in `other` keeps ours.
    pub fn merge(mut self, other: Self) -> Self {
        let username = if other.identity.username.is_empty() {
            std::mem::take(&mut self.identity.username)
        } else {
            other.identity.username.clone()
        };
        self = other;
        self.identity.username = username;
        self
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(username) = std::env::var(format!("{ENV_PREFIX}_IDENTITY_USERNAME")) {
            self.identity.username = username;
        }

        if let Ok(mode) = std::env::var(format!("{ENV_PREFIX}_NETWORK_MODE")) {
            self.network.mode = mode.parse()?;
        }

        if let Ok(port) = std::env::var(format!("{ENV_PREFIX}_NETWORK_BASE_PORT")) {
            self.network.base_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_NETWORK_BASE_PORT"),
                value: port,
            })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.identity.username.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "identity.username".to_string(),
            }
            .into());
        }

        if self.identity.rsa_key_bits < 1024 {
            return Err(invalid("identity.rsa_key_bits", self.identity.rsa_key_bits));
        }

        if self.network.port_range == 0 {
            return Err(invalid("network.port_range", 0));
        }

        if self.network.mode == NetworkMode::Local && self.network.base_port == 0 {
            return Err(invalid("network.base_port", 0));
        }

        if self.handshake.max_attempts == 0 {
            return Err(invalid("handshake.max_attempts", 0));
        }

        if self.hole_punch.attempts == 0 {
            return Err(invalid("hole_punch.attempts", 0));
        }

        if self.discovery.liveness_timeout_ms == 0 || self.discovery.sweep_interval_ms == 0 {
            return Err(invalid("discovery", 0));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: impl ToString) -> crate::MessengerError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn named(username: &str) -> MessengerConfig {
        let mut config = MessengerConfig::default();
        config.identity.username = username.to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = MessengerConfig::default();
        assert_eq!(config.network.base_port, 12346);
        assert_eq!(config.network.port_range, 50);
        assert_eq!(config.discovery.sweep_interval(), Duration::from_secs(15));
        assert_eq!(config.handshake.max_attempts, 5);
        assert_eq!(config.rendezvous.stun_server, "stun.l.google.com:19302");

        // No username yet
        assert!(config.validate().is_err());
        assert!(named("alice").validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = named("alice").to_toml_string().unwrap();
        assert!(toml_str.contains("base_port"));
        assert!(toml_str.contains("mode = \"local\""));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = named("alice");
        config.network.mode = NetworkMode::Internet;
        config.rendezvous.bootstrap_nodes = vec!["/ip4/1.2.3.4/tcp/4001".to_string()];
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = MessengerConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.identity.username, "alice");
        assert_eq!(loaded.network.mode, NetworkMode::Internet);
        assert_eq!(loaded.rendezvous.bootstrap_nodes.len(), 1);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[identity]\nusername = \"carol\"\n").unwrap();

        let loaded = MessengerConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.identity.username, "carol");
        assert_eq!(loaded.hole_punch.attempts, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = named("alice");
        config.network.port_range = 0;
        assert!(config.validate().is_err());

        config = named("alice");
        config.identity.rsa_key_bits = 512;
        assert!(config.validate().is_err());

        config = named("alice");
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config = named("alice");
        config.network.base_port = 0;
        assert!(config.validate().is_err());
        config.network.mode = NetworkMode::Internet;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let base = named("alice");
        let mut other = MessengerConfig::default();
        other.network.base_port = 4002;

        let merged = base.merge(other);
        assert_eq!(merged.network.base_port, 4002);
        assert_eq!(merged.identity.username, "alice");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("LAN".parse::<NetworkMode>().unwrap(), NetworkMode::Local);
        assert_eq!(
            "internet".parse::<NetworkMode>().unwrap(),
            NetworkMode::Internet
        );
        assert!("mesh".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MESSENGER_NETWORK_BASE_PORT", "9999");

        let config = MessengerConfig::default().merge_from_env().unwrap();
        assert_eq!(config.network.base_port, 9999);

        std::env::remove_var("MESSENGER_NETWORK_BASE_PORT");
    }
}
