//! Credential providers
//!
//! A provider performs exactly one fetch per call. Retrying is the session
//! manager's job.

use super::clock::Clock;
use super::sas::generate_sas_token;
use crate::identity::DeviceIdentity;
use crate::protocol::Credential;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Fetch failures
#[derive(Debug, Error)]
pub enum FetchError {
    /// No response was received
    #[error("Registration request failed: {0}")]
    Network(String),
    /// A response arrived but its body was not a credential
    #[error("Registration response malformed: {0}")]
    Protocol(String),
    /// The endpoint answered with a non-2xx status
    #[error("Registration rejected with status {status}")]
    Rejected { status: u16 },
}

/// Source of fresh credentials
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn fetch(&self, identity: &DeviceIdentity) -> Result<Credential, FetchError>;
}

/// Registration endpoint client: `POST {base}/api/watch/registration/{device_id}`
pub struct HttpConfigProvider {
    client: Client,
    api_key: String,
}

impl HttpConfigProvider {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }

    /// Decode a registration body (pure function)
    pub fn parse_credential(body: &[u8]) -> Result<Credential, FetchError> {
        let credential: Credential =
            serde_json::from_slice(body).map_err(|e| FetchError::Protocol(e.to_string()))?;

        if credential.broker_host.trim().is_empty() {
            return Err(FetchError::Protocol("iot_host is empty".to_string()));
        }
        if credential.auth_token.is_empty() {
            return Err(FetchError::Protocol("sas_token is empty".to_string()));
        }

        Ok(credential)
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn fetch(&self, identity: &DeviceIdentity) -> Result<Credential, FetchError> {
        let url = identity.registration_url();
        debug!(url = %url, "Requesting credential from registration endpoint");

        let response = self
            .client
            .post(&url)
            .header("tenantID", identity.tenant_id())
            .header("apiKey", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Registration endpoint rejected request");
            return Err(FetchError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let credential = Self::parse_credential(&body)?;
        debug!(
            host = %credential.broker_host,
            expiry_seconds = credential.expiry_seconds,
            "Credential received"
        );
        Ok(credential)
    }
}

/// Mints shared access signatures locally from a device key instead of
/// calling the registration endpoint
pub struct SharedKeyProvider {
    broker_host: String,
    device_key: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SharedKeyProvider {
    pub fn new(
        broker_host: impl Into<String>,
        device_key: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker_host: broker_host.into(),
            device_key: device_key.into(),
            ttl,
            clock,
        }
    }
}

#[async_trait]
impl ConfigProvider for SharedKeyProvider {
    async fn fetch(&self, identity: &DeviceIdentity) -> Result<Credential, FetchError> {
        let now_secs = self.clock.now_ms() / 1000;
        let expires_at = now_secs + self.ttl.as_secs() as i64;

        let token = generate_sas_token(
            &self.broker_host,
            identity.device_id(),
            &self.device_key,
            expires_at,
        )
        .map_err(|e| FetchError::Protocol(e.to_string()))?;

        Ok(Credential::new(
            self.broker_host.clone(),
            token,
            self.ttl.as_secs_f64(),
        ))
    }
}
