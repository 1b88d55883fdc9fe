//! TOML-based configuration for a ClipScape node.
//!
//! Reads and writes [`NodeConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\ClipScape\config.toml`
//! - Linux:    `~/.config/clipscape/config.toml`
//! - macOS:    `~/Library/Application Support/ClipScape/config.toml`
//!
//! Every field has a default, so a missing file or a partial file both work:
//!
//! ```toml
//! [node]
//! device_name = "office-pc"
//! port = 9999
//!
//! [discovery]
//! interval_ms = 5000
//! timeout_ms = 2000
//! seeds = ["192.168.1.50:9999"]
//! ```
//!
//! # Port override
//!
//! The `NETWORK_PORT` environment variable replaces `node.port` when it holds
//! a valid port number.  Invalid values are ignored with a warning.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Environment variable that overrides the shared UDP/TCP port.
pub const PORT_ENV_VAR: &str = "NETWORK_PORT";

/// Floor applied to the discovery interval and timeout.
pub const MIN_DISCOVERY_MS: u64 = 500;

/// Floor applied to liveness timings.
pub const MIN_LIVENESS_MS: u64 = 100;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An address field does not parse.
    #[error("invalid {field} {value:?}")]
    InvalidAddress { field: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub liveness: LivenessSection,
    #[serde(default)]
    pub transport: TransportSection,
}

/// Identity and socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSection {
    /// Name announced to other devices.  Defaults to the host name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Shared port for UDP discovery and TCP signaling.
    #[serde(default = "default_port")]
    pub port: u16,
    /// IP address the signaling listener binds to.  `"0.0.0.0"` binds all
    /// interfaces.  The discovery responder uses it too unless broadcast
    /// discovery is on, in which case it listens on all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// LAN address of this host.  Auto-detected when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Discovery cadence and targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverySection {
    /// Period between automatic discovery passes.
    #[serde(default = "default_discovery_interval_ms")]
    pub interval_ms: u64,
    /// How long one pass collects replies.
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Send requests to the broadcast addresses.
    #[serde(default = "default_true")]
    pub broadcast: bool,
    /// Extra unicast targets (`"ip:port"`), for networks that drop broadcasts.
    #[serde(default)]
    pub seeds: Vec<String>,
}

/// Heartbeat timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivenessSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A connected peer silent for longer than this is evicted.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
}

/// Data-channel transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportSection {
    /// STUN/TURN server URLs handed to ICE.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Label of the data channel the offerer creates.
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "clipscape-node".to_string())
}
fn default_port() -> u16 {
    9999
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_discovery_interval_ms() -> u64 {
    5_000
}
fn default_discovery_timeout_ms() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_peer_timeout_ms() -> u64 {
    20_000
}
fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_channel_label() -> String {
    "clipscape".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            port: default_port(),
            bind_address: default_bind_address(),
            local_ip: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            interval_ms: default_discovery_interval_ms(),
            timeout_ms: default_discovery_timeout_ms(),
            broadcast: default_true(),
            seeds: Vec::new(),
        }
    }
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            channel_label: default_channel_label(),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

fn at_least(ms: u64, floor: u64) -> Duration {
    Duration::from_millis(ms.max(floor))
}

impl NodeConfig {
    pub fn discovery_interval(&self) -> Duration {
        at_least(self.discovery.interval_ms, MIN_DISCOVERY_MS)
    }

    pub fn discovery_timeout(&self) -> Duration {
        at_least(self.discovery.timeout_ms, MIN_DISCOVERY_MS)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        at_least(self.liveness.heartbeat_interval_ms, MIN_LIVENESS_MS)
    }

    pub fn peer_timeout(&self) -> Duration {
        at_least(self.liveness.peer_timeout_ms, MIN_LIVENESS_MS)
    }

    /// Parsed `node.bind_address`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if the value is not an IP.
    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.node
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                field: "bind_address",
                value: self.node.bind_address.clone(),
            })
    }

    /// Parsed `node.local_ip`, if set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if the value is not an IP.
    pub fn local_ip_override(&self) -> Result<Option<IpAddr>, ConfigError> {
        self.node
            .local_ip
            .as_deref()
            .map(|raw| {
                raw.parse().map_err(|_| ConfigError::InvalidAddress {
                    field: "local_ip",
                    value: raw.to_string(),
                })
            })
            .transpose()
    }

    /// Parsed discovery seeds.  Entries that do not parse are skipped.
    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        self.discovery
            .seeds
            .iter()
            .filter_map(|raw| match raw.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("ignoring invalid discovery seed {raw:?}");
                    None
                }
            })
            .collect()
    }

    /// Applies environment overrides (currently only [`PORT_ENV_VAR`]).
    pub fn apply_env_overrides(&mut self) {
        let value = std::env::var(PORT_ENV_VAR).ok();
        self.apply_port_override(value.as_deref());
    }

    /// Replaces the port if `value` is a valid port number.
    pub fn apply_port_override(&mut self, value: Option<&str>) {
        let Some(raw) = value else {
            return;
        };
        match raw.trim().parse::<u16>() {
            Ok(port) => self.node.port = port,
            Err(_) => warn!("ignoring invalid {PORT_ENV_VAR}={raw:?}"),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads a config from `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &NodeConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ClipScape"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("clipscape"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ClipScape")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
