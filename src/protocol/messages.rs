//! Wire message types for the IoT-hub session
//!
//! This module defines the JSON documents exchanged with the registration
//! endpoint, the persisted credential record and the cloud-to-device
//! notification body.

use serde::{Deserialize, Serialize};

/// Authorization grant issued by the registration endpoint for one device.
///
/// `expiry_seconds` is a relative validity window, not an absolute timestamp.
///
/// # Examples
/// ```
/// use hubsession::protocol::Credential;
///
/// let json = r#"{"iot_host":"hub.example.net","sas_token":"SharedAccessSignature sr=x","expiry":3600.0}"#;
/// let credential: Credential = serde_json::from_str(json).unwrap();
/// assert_eq!(credential.broker_host, "hub.example.net");
/// assert_eq!(credential.expiry_seconds, 3600.0);
/// ```
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    /// Broker host name
    #[serde(rename = "iot_host")]
    pub broker_host: String,
    /// Opaque token used as the MQTT password
    #[serde(rename = "sas_token")]
    pub auth_token: String,
    /// Validity window in seconds
    #[serde(rename = "expiry")]
    pub expiry_seconds: f64,
}

impl Credential {
    pub fn new(
        broker_host: impl Into<String>,
        auth_token: impl Into<String>,
        expiry_seconds: f64,
    ) -> Self {
        Self {
            broker_host: broker_host.into(),
            auth_token: auth_token.into(),
            expiry_seconds,
        }
    }
}

// The token is a bearer secret; keep it out of Debug output and therefore out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("broker_host", &self.broker_host)
            .field("auth_token", &"***")
            .field("expiry_seconds", &self.expiry_seconds)
            .finish()
    }
}

/// A credential together with the wall-clock time (ms since epoch) it was fetched.
///
/// Persisted as `{"config": {...}, "savedOnMs": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedCredential {
    #[serde(rename = "config")]
    pub credential: Credential,
    #[serde(rename = "savedOnMs")]
    pub fetched_at_ms: i64,
}

impl CachedCredential {
    pub fn new(credential: Credential, fetched_at_ms: i64) -> Self {
        Self {
            credential,
            fetched_at_ms,
        }
    }

    /// A record is valid while `now - fetched_at < expiry * 1000` and the expiry is positive.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        let expiry = self.credential.expiry_seconds;
        if expiry.is_nan() || expiry <= 0.0 {
            return false;
        }
        let elapsed_ms = now_ms.saturating_sub(self.fetched_at_ms) as f64;
        elapsed_ms < expiry * 1000.0
    }

    /// Milliseconds of validity left at `now_ms`, zero once expired.
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        if !self.is_valid(now_ms) {
            return 0;
        }
        let deadline = self.fetched_at_ms as f64 + self.credential.expiry_seconds * 1000.0;
        (deadline - now_ms as f64).max(0.0) as i64
    }
}

/// Decoded cloud-to-device notification.
///
/// On the wire the body is `message` and the actions are `buttons`;
/// action order is positional and preserved.
///
/// # Examples
/// ```
/// use hubsession::protocol::Notification;
///
/// let json = r#"{"id":7,"caption":"Alert","message":"Door open","buttons":["Ack","Snooze"]}"#;
/// let notification: Notification = serde_json::from_str(json).unwrap();
/// assert_eq!(notification.id, 7);
/// assert_eq!(notification.body, "Door open");
/// assert_eq!(notification.actions, vec!["Ack", "Snooze"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    /// Correlation key for action replies
    pub id: i64,
    pub caption: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "buttons", default)]
    pub actions: Vec<String>,
}

/// Body of an action reply: the label of the pressed button.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRequest {
    pub pressed: String,
}
