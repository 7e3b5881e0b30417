//! Configuration for the session manager
//!
//! Loaded from a TOML file. Secrets are never stored in the file: sections
//! name the environment variable that holds them and they are resolved at
//! runtime.

use crate::events::OverflowPolicy;
use crate::protocol::DEFAULT_API_VERSION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub events: EventsSection,
}

/// Device identity and registration endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Explicit device identifier (takes precedence over `id_env`)
    pub id: Option<String>,
    /// Environment variable containing the device identifier
    pub id_env: Option<String>,
    /// Base URL of the registration / reply API
    pub api_base_url: String,
    /// Value of the `tenantID` header
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    /// Environment variable containing the `apiKey` header value
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Environment variable containing a base64 device key; when set, tokens
    /// are minted locally instead of calling the registration endpoint
    pub shared_key_env: Option<String>,
    /// Broker host used together with `shared_key_env`
    pub broker_host: Option<String>,
}

/// Broker connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Fixed delay between a failure and the next attempt
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Consecutive failed attempts before giving up (None = retry forever)
    pub max_reconnect_attempts: Option<u32>,
    /// Deadline for ConnAck and SubAck
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Timeout for registration and reply HTTP calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: None,
            connect_timeout_secs: default_connect_timeout(),
            broker_port: default_broker_port(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SessionSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Credential cache location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

/// Notification fan-out
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsSection {
    /// Pending items buffered per subscriber
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

fn default_tenant_id() -> String {
    "1".to_string()
}

fn default_api_key_env() -> String {
    "HUBSESSION_API_KEY".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_broker_port() -> u16 {
    8883
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("hubsession-credential.json")
}

fn default_event_capacity() -> usize {
    5
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HubConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.device.api_base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "device.api_base_url '{}' is not a valid URL: {e}",
                self.device.api_base_url
            ))
        })?;

        if self.session.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.reconnect_delay_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.reconnect_delay_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.max_reconnect_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "session.max_reconnect_attempts must be greater than 0 or omitted for unlimited"
                    .to_string(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "events.capacity must be greater than 0".to_string(),
            ));
        }
        if self.device.shared_key_env.is_some() && self.device.broker_host.is_none() {
            return Err(ConfigError::InvalidConfig(
                "device.shared_key_env requires device.broker_host".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Get the registration API key from the environment
    pub fn get_api_key(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.device.api_key_env)
    }

    /// Get the shared device key from the environment, if configured
    pub fn get_shared_key(&self) -> Result<Option<String>, ConfigError> {
        self.device
            .shared_key_env
            .as_deref()
            .map(Self::get_env_var_required)
            .transpose()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"
api_base_url = "http://localhost:8080"

[session]
reconnect_delay_secs = 1
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
