//! Device identity resolution
//!
//! The identity is resolved once at startup and then passed by value to the
//! components that need it. There is no process-wide mutable copy.

use crate::config::{ConfigError, DeviceSection};
use std::path::Path;
use tracing::{debug, info};
use url::Url;

/// Sentinel some platforms report when no hardware identifier is available.
pub const UNKNOWN_DEVICE_ID: &str = "UNKNOWN";

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Immutable device identity plus the API it registers against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
    api_base_url: String,
    base: Url,
    tenant_id: String,
}

impl DeviceIdentity {
    /// Build an identity, rejecting blank ids, the `UNKNOWN` sentinel and
    /// base URLs that cannot carry a path
    pub fn new(
        device_id: impl Into<String>,
        api_base_url: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let device_id = device_id.into().trim().to_string();
        validate_device_id(&device_id)?;

        let api_base_url = api_base_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&api_base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("API base URL '{api_base_url}' is invalid: {e}"))
        })?;
        if base.cannot_be_a_base() {
            return Err(ConfigError::InvalidConfig(format!(
                "API base URL '{api_base_url}' cannot carry a path"
            )));
        }

        Ok(Self {
            device_id,
            api_base_url,
            base,
            tenant_id: tenant_id.into(),
        })
    }

    /// Resolve from configuration: explicit id, then `id_env`, then the host machine id
    pub fn resolve(section: &DeviceSection) -> Result<Self, ConfigError> {
        let device_id = match (&section.id, &section.id_env) {
            (Some(id), _) => {
                debug!("Using device id from configuration");
                id.clone()
            }
            (None, Some(env_name)) => {
                debug!(env = %env_name, "Using device id from environment");
                std::env::var(env_name)
                    .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()))?
            }
            (None, None) => {
                debug!(path = MACHINE_ID_PATH, "Using host machine id as device id");
                read_machine_id(Path::new(MACHINE_ID_PATH))?
            }
        };

        let identity = Self::new(device_id, &section.api_base_url, &section.tenant_id)?;
        info!(device_id = %identity.device_id, "Device identity resolved");
        Ok(identity)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// `{base}/api/watch/registration/{device_id}`, with the id percent-encoded
    pub fn registration_url(&self) -> String {
        self.endpoint(&["api", "watch", "registration", &self.device_id])
    }

    /// `{base}/api/scratch/reply/{message_id}`
    pub fn reply_url(&self, message_id: i64) -> String {
        self.endpoint(&["api", "scratch", "reply", &message_id.to_string()])
    }

    fn endpoint(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.into()
    }
}

/// Device ids must be non-blank, not the `UNKNOWN` sentinel, and usable in a topic level
pub fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    if device_id.trim().is_empty() {
        return Err(ConfigError::InvalidDeviceId(
            "device id is empty".to_string(),
        ));
    }
    if device_id == UNKNOWN_DEVICE_ID {
        return Err(ConfigError::InvalidDeviceId(
            "device id is not available (UNKNOWN)".to_string(),
        ));
    }
    if device_id.contains(['/', '#', '+']) {
        return Err(ConfigError::InvalidDeviceId(format!(
            "device id '{device_id}' contains MQTT topic characters"
        )));
    }
    Ok(())
}

fn read_machine_id(path: &Path) -> Result<String, ConfigError> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}
