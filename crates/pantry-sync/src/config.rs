//! # Sync Configuration
//!
//! Configuration for both ends of the device link.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     PANTRY_SERVER_URL=ws://192.168.1.20:8080                           │
//! │     PANTRY_DEVICE_NAME="Kitchen tablet"                                │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/mealplanner/sync.toml (Linux)                            │
//! │     ~/Library/Application Support/com.pantry.mealplanner/sync.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     port 8080, ping 30s, 5 reconnect attempts, 2s backoff unit         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The companion's device id and last known server address also live in its
//! database; a value set here overrides the stored one.
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! name = "Kitchen tablet"
//! device_type = "tablet"
//!
//! [host]
//! port = 8080
//! pairing_timeout_secs = 120
//!
//! [client]
//! server_url = "192.168.1.20"   # bare host → ws://192.168.1.20:8080
//! max_reconnect_attempts = 5
//!
//! [discovery]
//! udp_port = 5556
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::discovery::{normalize_server_url, DEFAULT_DISCOVERY_PORT, SERVICE_TYPE};
use crate::error::{SyncError, SyncResult};
use pantry_core::{DeviceType, DEFAULT_HOST_PORT};

// =============================================================================
// Device Configuration
// =============================================================================

/// Identity this process presents to its peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Fixed device id. When unset the companion uses the id stored in its
    /// database (generated on first run) and the host generates one per run.
    #[serde(default)]
    pub id: Option<String>,

    /// Human-readable name (sent as `X-Device-Name`, announced by the host).
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Companion form factor (sent as `X-Device-Type`).
    #[serde(default)]
    pub device_type: DeviceType,
}

fn default_device_name() -> String {
    "Pantry device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: None,
            name: default_device_name(),
            device_type: DeviceType::default(),
        }
    }
}

// =============================================================================
// Host Settings
// =============================================================================

/// Settings for the desktop host's WebSocket server.
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  port / bind_addr          where companions connect (ws://host:8080/)   │
/// │  pairing_code_ttl_secs     lifetime of one generated code               │
/// │  pairing_timeout_secs      per-session window to submit a code          │
/// │  ping_interval_secs        WebSocket ping cadence per session           │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "default_host_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_pairing_code_ttl")]
    pub pairing_code_ttl_secs: u64,

    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Announce the host over UDP discovery.
    #[serde(default = "default_true")]
    pub advertise: bool,
}

fn default_host_port() -> u16 {
    DEFAULT_HOST_PORT
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_pairing_code_ttl() -> u64 {
    600
}

fn default_pairing_timeout() -> u64 {
    120
}

fn default_ping_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for HostSettings {
    fn default() -> Self {
        HostSettings {
            port: default_host_port(),
            bind_addr: default_bind_addr(),
            pairing_code_ttl_secs: default_pairing_code_ttl(),
            pairing_timeout_secs: default_pairing_timeout(),
            ping_interval_secs: default_ping_interval(),
            advertise: true,
        }
    }
}

impl HostSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Client Settings
// =============================================================================

/// Settings for the companion's connection client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Explicit host address. Bare hosts get `ws://` and port 8080.
    #[serde(default)]
    pub server_url: Option<String>,

    /// Handshake timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Protocol `ping` interval while connected (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Reconnect delay is `attempts * unit`, capped at `cap`.
    #[serde(default = "default_reconnect_unit")]
    pub reconnect_unit_secs: u64,

    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_secs: u64,

    /// Automatic reconnects stop after this many consecutive failures.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_reconnect_unit() -> u64 {
    2
}

fn default_reconnect_cap() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            server_url: None,
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ping_interval(),
            reconnect_unit_secs: default_reconnect_unit(),
            reconnect_cap_secs: default_reconnect_cap(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

// =============================================================================
// Discovery Settings
// =============================================================================

/// Configuration for LAN discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Service name matched by the resolver.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// UDP broadcast port.
    #[serde(default = "default_discovery_port")]
    pub udp_port: u16,

    /// Length of one resolve attempt (seconds).
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
}

fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_discovery_timeout() -> u64 {
    5
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            enabled: true,
            service_type: default_service_type(),
            udp_port: default_discovery_port(),
            timeout_secs: default_discovery_timeout(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Where the SQLite file lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Defaults to `pantry-sync.db` in the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub host: HostSettings,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref id) = self.device.id {
            pantry_core::validation::validate_device_id(id)
                .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        }

        if let Some(ref url) = self.client.server_url {
            normalize_server_url(url)?;
        }

        if self.client.max_reconnect_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_reconnect_attempts must be greater than 0".into(),
            ));
        }

        if self.client.reconnect_unit_secs == 0
            || self.client.reconnect_cap_secs < self.client.reconnect_unit_secs
        {
            return Err(SyncError::InvalidConfig(
                "reconnect_cap_secs must be >= reconnect_unit_secs > 0".into(),
            ));
        }

        if self.client.ping_interval_secs == 0 || self.host.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "ping_interval_secs must be greater than 0".into(),
            ));
        }

        if self.host.pairing_timeout_secs == 0 || self.host.pairing_code_ttl_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "pairing timeouts must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("PANTRY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = Some(id);
        }

        if let Ok(name) = std::env::var("PANTRY_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(device_type) = std::env::var("PANTRY_DEVICE_TYPE") {
            match device_type.parse() {
                Ok(parsed) => self.device.device_type = parsed,
                Err(_) => warn!(%device_type, "Unknown device type in environment"),
            }
        }

        if let Ok(url) = std::env::var("PANTRY_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.client.server_url = Some(url);
        }

        if let Ok(port) = std::env::var("PANTRY_HOST_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding host port from environment");
                self.host.port = p;
            }
        }

        if let Ok(secs) = std::env::var("PANTRY_PAIRING_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.host.pairing_timeout_secs = s;
            }
        }

        if let Ok(port) = std::env::var("PANTRY_DISCOVERY_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.discovery.udp_port = p;
            }
        }

        if let Ok(path) = std::env::var("PANTRY_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "pantry", "mealplanner")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Resolved SQLite path: configured, else the platform data dir.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("pantry-sync.db")))
            .unwrap_or_else(|| PathBuf::from("pantry-sync.db"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.client.connect_timeout_secs)
    }

    pub fn client_ping_interval(&self) -> Duration {
        Duration::from_secs(self.client.ping_interval_secs)
    }

    pub fn host_ping_interval(&self) -> Duration {
        Duration::from_secs(self.host.ping_interval_secs)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.host.pairing_timeout_secs)
    }

    pub fn pairing_code_ttl(&self) -> Duration {
        Duration::from_secs(self.host.pairing_code_ttl_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.timeout_secs)
    }
}
