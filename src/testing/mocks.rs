//! Mock implementations for testing
//!
//! Provides a scripted transport, a counting config provider and a manual
//! clock so the session manager can be exercised without a broker or a
//! registration endpoint.

use crate::credentials::{Clock, ConfigProvider, FetchError};
use crate::identity::DeviceIdentity;
use crate::protocol::Credential;
use crate::transport::{
    ConnectFailure, ConnectRequest, Connection, ConnectionId, EventSender, Transport,
    TransportError, TransportEvent, TransportEventKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How a mock connection answers the CONNECT
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectScript {
    Accept,
    RejectAuth,
    Fail(String),
    /// Never answer; exercises the handshake deadline
    Silent,
    /// `open` itself returns an error
    OpenError(String),
}

/// How a mock connection answers a SUBSCRIBE
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeScript {
    Ack,
    Reject(String),
    /// `subscribe` itself returns an error
    RequestError(String),
    Silent,
}

#[derive(Debug, Default)]
struct MockTransportState {
    connect_script: VecDeque<ConnectScript>,
    subscribe_script: VecDeque<SubscribeScript>,
    opened: Vec<ConnectRequest>,
    subscriptions: Vec<(ConnectionId, String)>,
    closed: Vec<ConnectionId>,
    live: Option<(ConnectionId, String, EventSender)>,
}

/// Mock transport for testing; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue handshake outcomes; once exhausted every handshake is accepted
    pub async fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectScript>) {
        self.state.lock().await.connect_script.extend(outcomes);
    }

    /// Queue subscribe outcomes; once exhausted every subscription is acknowledged
    pub async fn script_subscribes(&self, outcomes: impl IntoIterator<Item = SubscribeScript>) {
        self.state.lock().await.subscribe_script.extend(outcomes);
    }

    pub async fn open_count(&self) -> usize {
        self.state.lock().await.opened.len()
    }

    pub async fn opened(&self) -> Vec<ConnectRequest> {
        self.state.lock().await.opened.clone()
    }

    pub async fn subscriptions(&self) -> Vec<(ConnectionId, String)> {
        self.state.lock().await.subscriptions.clone()
    }

    pub async fn closed(&self) -> Vec<ConnectionId> {
        self.state.lock().await.closed.clone()
    }

    /// Id of the connection that has been opened and not closed
    pub async fn live_connection(&self) -> Option<ConnectionId> {
        self.state.lock().await.live.as_ref().map(|(id, _, _)| *id)
    }

    /// Post an event as if it came from connection `connection_id`
    pub async fn emit(&self, connection_id: ConnectionId, kind: TransportEventKind) -> bool {
        let sender = self
            .state
            .lock()
            .await
            .live
            .as_ref()
            .map(|(_, _, events)| events.clone());
        match sender {
            Some(events) => events
                .send(TransportEvent::new(connection_id, kind))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Drop the live connection from the broker side
    pub async fn disconnect_live(&self, reason: &str) -> bool {
        match self.live_connection().await {
            Some(id) => {
                self.emit(id, TransportEventKind::Disconnected(reason.to_string()))
                    .await
            }
            None => false,
        }
    }

    /// Deliver a payload on the live connection's devicebound topic
    pub async fn deliver(&self, payload: impl Into<Bytes>) -> bool {
        let live = self
            .state
            .lock()
            .await
            .live
            .as_ref()
            .map(|(id, device_id, _)| (*id, device_id.clone()));
        match live {
            Some((id, device_id)) => {
                let topic = format!("devices/{device_id}/messages/devicebound/%24.to=%2Fdevices");
                self.emit(
                    id,
                    TransportEventKind::Delivery {
                        topic,
                        payload: payload.into(),
                    },
                )
                .await
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn open(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<MockConnection, TransportError> {
        let mut state = self.state.lock().await;
        state.opened.push(request.clone());
        let script = state
            .connect_script
            .pop_front()
            .unwrap_or(ConnectScript::Accept);

        let id = request.connection_id;
        let reply = match script {
            ConnectScript::OpenError(reason) => return Err(TransportError::ConnectFailed(reason)),
            ConnectScript::Accept => Some(TransportEventKind::ConnAck),
            ConnectScript::RejectAuth => Some(TransportEventKind::ConnectFailed(
                ConnectFailure::AuthRejected("NotAuthorized".to_string()),
            )),
            ConnectScript::Fail(reason) => Some(TransportEventKind::ConnectFailed(
                ConnectFailure::Transport(reason),
            )),
            ConnectScript::Silent => None,
        };

        state.live = Some((id, request.device_id.clone(), events.clone()));
        drop(state);

        if let Some(kind) = reply {
            let _ = events.send(TransportEvent::new(id, kind)).await;
        }

        Ok(MockConnection {
            id,
            events,
            state: self.state.clone(),
        })
    }
}

/// Connection handed out by [`MockTransport`]
#[derive(Debug)]
pub struct MockConnection {
    id: ConnectionId,
    events: EventSender,
    state: Arc<Mutex<MockTransportState>>,
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let script = {
            let mut state = self.state.lock().await;
            state.subscriptions.push((self.id, topic.to_string()));
            state
                .subscribe_script
                .pop_front()
                .unwrap_or(SubscribeScript::Ack)
        };

        let reply = match script {
            SubscribeScript::RequestError(reason) => {
                return Err(TransportError::SubscribeFailed(reason))
            }
            SubscribeScript::Ack => Some(TransportEventKind::SubAck),
            SubscribeScript::Reject(reason) => Some(TransportEventKind::SubscribeRejected(reason)),
            SubscribeScript::Silent => None,
        };

        if let Some(kind) = reply {
            let _ = self.events.send(TransportEvent::new(self.id, kind)).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().await;
        state.closed.push(self.id);
        if state.live.as_ref().is_some_and(|(id, _, _)| *id == self.id) {
            state.live = None;
        }
    }
}

/// Config provider with scripted results and a call counter
#[derive(Debug, Default)]
pub struct MockConfigProvider {
    responses: std::sync::Mutex<VecDeque<Result<Credential, FetchError>>>,
    fallback: Option<Credential>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockConfigProvider {
    /// Every fetch succeeds with `credential` unless a scripted result is queued
    pub fn returning(credential: Credential) -> Self {
        Self {
            fallback: Some(credential),
            ..Default::default()
        }
    }

    /// Every fetch fails with a network error unless a scripted result is queued
    pub fn failing() -> Self {
        Self::default()
    }

    /// Wait this long inside every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: Result<Credential, FetchError>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigProvider for MockConfigProvider {
    async fn fetch(&self, _identity: &DeviceIdentity) -> Result<Credential, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match scripted {
            Some(response) => response,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| FetchError::Network("mock registration endpoint offline".to_string())),
        }
    }
}

/// Clock under test control
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Credential used throughout the tests
pub fn test_credential() -> Credential {
    Credential::new(
        "hub.example.net",
        "SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdevice-1&sig=abc&se=1",
        3600.0,
    )
}

/// Identity used throughout the tests
pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::new("device-1", "https://api.example.net", "1")
        .unwrap_or_else(|e| panic!("test identity must be valid: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn request(id: ConnectionId) -> ConnectRequest {
        ConnectRequest {
            connection_id: id,
            device_id: "device-1".to_string(),
            credential: test_credential(),
            port: 8883,
            keep_alive: Duration::from_secs(30),
            api_version: "2021-04-12".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mock_transport_follows_script() {
        let transport = MockTransport::new();
        transport
            .script_connects([ConnectScript::RejectAuth])
            .await;
        let (tx, mut rx) = mpsc::channel(8);

        let mut first = transport.open(request(1), tx.clone()).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            TransportEventKind::ConnectFailed(ConnectFailure::AuthRejected(_))
        ));
        first.close().await;
        assert_eq!(transport.live_connection().await, None);

        let mut second = transport.open(request(2), tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, TransportEventKind::ConnAck);
        second.subscribe("topic").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, TransportEventKind::SubAck);

        assert!(transport.deliver(&b"{}"[..]).await);
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.connection_id, 2);
        assert_eq!(transport.open_count().await, 2);
        assert_eq!(transport.closed().await, vec![1]);
    }

    #[tokio::test]
    async fn test_mock_provider_counts_calls() {
        let provider = MockConfigProvider::failing();
        provider.push_response(Ok(test_credential()));

        assert!(provider.fetch(&test_identity()).await.is_ok());
        assert!(matches!(
            provider.fetch(&test_identity()).await,
            Err(FetchError::Network(_))
        ));
        assert_eq!(provider.call_count(), 2);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_ms(), 3_000);
        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
    }
}
