//! Inbound message pipeline
//!
//! Decodes each broker delivery into a [`Notification`] and publishes it on
//! the notification bus. Bad payloads are logged and dropped; they never
//! reach the session state machine.

use crate::events::EventBus;
use crate::protocol::Notification;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a payload was dropped
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is empty")]
    Empty,
    #[error("Payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Payload is not a notification: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stateless decode-and-publish step
#[derive(Clone)]
pub struct MessagePipeline {
    bus: EventBus<Notification>,
}

impl MessagePipeline {
    pub fn new(bus: EventBus<Notification>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &EventBus<Notification> {
        &self.bus
    }

    /// Decode a raw payload (pure function)
    pub fn decode(raw: &[u8]) -> Result<Notification, DecodeError> {
        let text = std::str::from_utf8(raw)?;
        if text.trim().is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Handle one delivery; may wait for bus capacity
    pub async fn on_delivery(&self, raw: &[u8]) {
        match Self::decode(raw) {
            Ok(notification) => {
                let id = notification.id;
                let receivers = self.bus.publish(notification).await;
                debug!(id, receivers, "Notification published");
            }
            Err(e) => {
                warn!(bytes = raw.len(), "Dropping undecodable message: {}", e);
            }
        }
    }
}
