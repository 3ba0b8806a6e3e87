//! Configuration management for wicket
//!
//! Gate profiles are stored as TOML under the user config directory. A
//! profile carries everything needed to construct a session of the
//! configured transport variant plus the gate's retry policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::TransportKind;

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wicket")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
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

/// Top-level configuration file: named gate profiles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WicketConfig {
    /// Gate profiles keyed by name
    pub gates: HashMap<String, GateConfig>,
}

impl WicketConfig {
    /// Look up a gate profile by name
    pub fn gate(&self, name: &str) -> Result<&GateConfig, ConfigError> {
        self.gates
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }
}

/// Authentication material for transports that need it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Public key authentication
    Key {
        /// Path to the private key
        path: PathBuf,
    },
    /// Password authentication
    Password {
        /// Plain password
        password: String,
    },
}

/// Configuration for one gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Remote endpoint, `host` or `host:port`
    pub address: String,

    /// Username presented to the remote peer
    pub username: String,

    /// Authentication material (required for SSH)
    pub auth: Option<AuthConfig>,

    /// Expected SSH host key fingerprint; connections presenting a
    /// different key are rejected
    pub host_key: Option<String>,

    /// Transport variant to use
    pub transport: TransportKind,

    /// Whether this gate's layout is persisted across app restarts
    pub store: bool,

    /// Command spawned in new panes (None = login shell)
    pub command: Option<String>,

    /// Signaling endpoint for WebRTC and hybrid transports
    pub signaling_url: Option<String>,

    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,

    /// Retry policy
    pub retry: RetryConfig,

    /// Keepalive monitoring
    pub keepalive: KeepaliveConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            auth: None,
            host_key: None,
            transport: TransportKind::Ssh,
            store: true,
            command: None,
            signaling_url: None,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            retry: RetryConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl GateConfig {
    /// SSH endpoint with the default port applied when absent
    pub fn ssh_address(&self) -> String {
        if self.address.contains(':') {
            self.address.clone()
        } else {
            format!("{}:22", self.address)
        }
    }

    /// Check the profile for problems that would make `connect()` fail
    /// before any network I/O. These are the only errors a connect reports
    /// synchronously; everything else funnels through the failure taxonomy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::MissingField("address".to_string()));
        }
        match self.transport {
            TransportKind::Ssh => {
                if self.username.is_empty() {
                    return Err(ConfigError::MissingField("username".to_string()));
                }
                if self.auth.is_none() {
                    return Err(ConfigError::MissingField("auth".to_string()));
                }
            }
            TransportKind::WebRtc | TransportKind::Hybrid => {
                if self.signaling_url.is_none() {
                    return Err(ConfigError::MissingField("signaling_url".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Retry policy for a gate's connect attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum connect attempts before giving up
    pub max_retries: u32,

    /// Per-attempt connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Backoff between attempts
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Keepalive monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Probe interval
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// How long to wait before treating the connection as timed out
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

// Helper module for Duration serialization as integer seconds
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
