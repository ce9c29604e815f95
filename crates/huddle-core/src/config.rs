//! Configuration system for Huddle
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/huddle/config.toml
//! - Linux: ~/.config/huddle/config.toml
//! - Windows: %APPDATA%/huddle/config.toml
//!
//! All values are deployment-time constants; nothing here is negotiated
//! between clients at runtime.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::identity::{IdentityStrategy, DEFAULT_MAX_SLOTS};

/// Floor for the sweeper period; a zero period would spin
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Floor for the reconciliation tick
pub const MIN_RECONCILE_INTERVAL: Duration = Duration::from_millis(10);

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal service settings
    pub signal: SignalConfig,
    /// Mesh client settings
    pub client: ClientConfig,
    /// Network settings
    pub network: NetworkConfig,
}

/// Signal service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Listen port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// A room with no activity for this long is evicted
    pub staleness_secs: u64,
    /// How often the sweeper looks for stale rooms
    pub sweep_interval_secs: u64,
    /// Relayed signals held per polling participant
    pub mailbox_capacity: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            staleness_secs: 60,
            sweep_interval_secs: 30,
            mailbox_capacity: 64,
        }
    }
}

impl SignalConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    /// Never below [`MIN_SWEEP_INTERVAL`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs).max(MIN_SWEEP_INTERVAL)
    }
}

/// How the client learns about other participants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Announce + list over HTTP on every tick
    Poll,
    /// Persistent WebSocket with join/leave events
    Push,
}

/// Mesh client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the signal service (http or https)
    pub server_url: String,
    /// Discovery transport
    pub discovery: DiscoveryMode,
    /// Identity strategy
    pub identity: IdentityStrategy,
    /// Room capacity for the slot strategy
    pub max_slots: u32,
    /// STUN helper endpoints handed to the media layer
    pub stun_servers: Vec<String>,
    /// Reconciliation tick in milliseconds
    pub reconcile_interval_ms: u64,
    /// Give up on a negotiation after this many seconds
    pub negotiation_timeout_secs: u64,
    /// Close a connection once its peer has been missing from roster
    /// snapshots for this many seconds (never on a single snapshot)
    pub roster_grace_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".into(),
            discovery: DiscoveryMode::Poll,
            identity: IdentityStrategy::Opaque,
            max_slots: DEFAULT_MAX_SLOTS,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            reconcile_interval_ms: 3000,
            negotiation_timeout_secs: 15,
            roster_grace_secs: 30,
        }
    }
}

impl ClientConfig {
    /// Never below [`MIN_RECONCILE_INTERVAL`]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms).max(MIN_RECONCILE_INTERVAL)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn roster_grace(&self) -> Duration {
        Duration::from_secs(self.roster_grace_secs)
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "huddle", "huddle")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
