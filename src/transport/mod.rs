//! Broker transport abstraction
//!
//! A [`Transport`] opens one [`Connection`] per attempt. Handshake,
//! subscription and inbound traffic results are not returned inline: they
//! arrive later as [`TransportEvent`]s on the channel handed to `open`, and
//! the session manager processes them in order on its own task.

use crate::protocol::Credential;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Identifies one connection attempt; events from older attempts are stale
pub type ConnectionId = u64;

/// Channel transport drivers post their events to
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Everything needed to open one broker connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub connection_id: ConnectionId,
    pub device_id: String,
    pub credential: Credential,
    pub port: u16,
    pub keep_alive: Duration,
    pub api_version: String,
}

/// Transport errors raised synchronously by `open`/`subscribe`
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Connection already closed")]
    Closed,
}

/// Why a handshake failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The broker refused the credential; the cached credential must go
    AuthRejected(String),
    /// Network, TLS or any other failure
    Transport(String),
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailure::AuthRejected(reason) => write!(f, "authentication rejected: {reason}"),
            ConnectFailure::Transport(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}

/// Asynchronous completion or notification from a transport driver
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Handshake accepted
    ConnAck,
    /// Handshake failed
    ConnectFailed(ConnectFailure),
    /// Subscription acknowledged
    SubAck,
    /// Subscription refused or malformed acknowledgement
    SubscribeRejected(String),
    /// Inbound application message
    Delivery { topic: String, payload: Bytes },
    /// Established connection went away
    Disconnected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub connection_id: ConnectionId,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(connection_id: ConnectionId, kind: TransportEventKind) -> Self {
        Self {
            connection_id,
            kind,
        }
    }
}

/// Factory for broker connections
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Start connecting; the handshake outcome is posted to `events`
    async fn open(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<Self::Connection, TransportError>;
}

/// One live (or in-progress) broker connection
#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    fn id(&self) -> ConnectionId;

    /// Request an at-least-once subscription; the outcome is posted as an event
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Close gracefully. No `Disconnected` event is posted for a close.
    async fn close(&mut self);
}
