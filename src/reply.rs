//! Action replies: tell the backend which button the user pressed
//!
//! `POST {base}/api/scratch/reply/{message_id}` with `{"pressed": "<label>"}`.

use crate::identity::DeviceIdentity;
use crate::protocol::ReplyRequest;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("Reply request failed: {0}")]
    Network(String),
    #[error("Reply rejected with status {status}")]
    Rejected { status: u16 },
}

/// HTTP client for the action-reply endpoint
pub struct ReplyClient {
    client: Client,
    identity: DeviceIdentity,
}

impl ReplyClient {
    pub fn new(identity: DeviceIdentity, timeout: Duration) -> Result<Self, ReplyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplyError::Network(e.to_string()))?;

        Ok(Self { client, identity })
    }

    /// Report that `pressed` was chosen for notification `message_id`
    pub async fn send(&self, message_id: i64, pressed: &str) -> Result<(), ReplyError> {
        let url = self.identity.reply_url(message_id);
        debug!(url = %url, message_id, "Sending action reply");

        let response = self
            .client
            .post(&url)
            .header("tenantID", self.identity.tenant_id())
            .json(&ReplyRequest {
                pressed: pressed.to_string(),
            })
            .send()
            .await
            .map_err(|e| ReplyError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), message_id, "Reply endpoint rejected request");
            return Err(ReplyError::Rejected {
                status: status.as_u16(),
            });
        }

        info!(message_id, pressed, "Action reply delivered");
        Ok(())
    }
}
