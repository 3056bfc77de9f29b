//! Daemon Configuration
//!
//! Configuration management for the Whatshare daemon, stored as TOML in
//! `<config dir>/whatshare/daemon.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use whatshare_protocol::pairing::PairingConfig;
use whatshare_protocol::relay::{RetryPolicy, ShortenerConfig};

/// Name of the configuration file
const CONFIG_FILE: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Relay service configuration
    pub relay: RelayConfig,

    /// Relay retry configuration
    pub retry: RetryConfig,

    /// Pairing handshake configuration
    pub pairing: PairingSettings,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device model published to counterparts
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

/// Relay service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Shorten/expand endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Prefix of the short URLs minted by the service
    #[serde(default = "default_short_url_prefix")]
    pub short_url_prefix: String,

    /// URL the pairing descriptor is embedded into
    #[serde(default = "default_landing_url")]
    pub landing_url: String,

    /// API key for the service
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

/// Relay retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per relay call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Pairing handshake configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingSettings {
    /// Outer deadline for each relay call, in seconds
    #[serde(default)]
    pub handshake_deadline: Option<u64>,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Paired device registry
    pub registry_file: PathBuf,
}

fn default_device_type() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown Device".to_string())
}

fn default_api_url() -> String {
    "https://www.googleapis.com/urlshortener/v1/url".to_string()
}

fn default_short_url_prefix() -> String {
    "https://goo.gl/".to_string()
}

fn default_landing_url() -> String {
    "https://whatshare.example/pair".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("whatshare")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type: default_device_type(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            short_url_prefix: default_short_url_prefix(),
            landing_url: default_landing_url(),
            api_key: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let config_dir = default_config_dir();
        let registry_file = config_dir.join("devices.json");

        Self {
            config_dir,
            registry_file,
        }
    }
}

impl RetryConfig {
    /// Retry policy for relay calls
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE)
    }

    /// Load configuration from `path` (or the default location), creating a
    /// default file if none exists
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Relay client configuration
    pub fn shortener_config(&self) -> Result<ShortenerConfig> {
        let mut config = ShortenerConfig::new(
            &self.relay.api_url,
            &self.relay.short_url_prefix,
            &self.relay.landing_url,
        )
        .context("Invalid relay configuration")?
        .with_request_timeout(Duration::from_secs(self.relay.request_timeout));

        if let Some(key) = &self.relay.api_key {
            config = config.with_api_key(key.clone());
        }
        Ok(config)
    }

    /// Pairing service configuration
    pub fn pairing_config(&self) -> PairingConfig {
        let mut config = PairingConfig::new(self.device.device_type.clone());
        config.retry = self.retry.policy();
        config.handshake_deadline = self.pairing.handshake_deadline.map(Duration::from_secs);
        config
    }

    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.relay.api_key.is_some() {
            config.relay.api_key = Some("********".to_string());
        }
        config
    }
}
