//! Impure I/O operations for the MQTT transport
//!
//! Each [`MqttConnection`] owns one rumqttc event loop, polled on a
//! dedicated task. The task never reconnects: when the connection fails it
//! posts one terminal event and exits, and the session manager decides what
//! happens next.

use super::connection::configure_mqtt_options;
use super::message_handler::{EventRoute, MessageHandler};
use crate::mqtt_span;
use crate::transport::{
    ConnectRequest, Connection, ConnectionId, EventSender, Transport, TransportError,
    TransportEvent, TransportEventKind,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Request channel capacity between [`AsyncClient`] and its event loop
const REQUEST_CAPACITY: usize = 10;

/// How long a close waits for the DISCONNECT packet to be flushed
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// rumqttc-backed [`Transport`]
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Connection = MqttConnection;

    async fn open(
        &self,
        request: ConnectRequest,
        events: EventSender,
    ) -> Result<MqttConnection, TransportError> {
        let mqtt_options = configure_mqtt_options(&request)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            connection_id = request.connection_id,
            host = %request.credential.broker_host,
            port = request.port,
            "Opening MQTT connection"
        );

        let span = mqtt_span!(connection_id = request.connection_id);
        let handle = tokio::spawn(
            drive_event_loop(request.connection_id, event_loop, events, shutdown_rx)
                .instrument(span),
        );

        Ok(MqttConnection {
            id: request.connection_id,
            client,
            shutdown_tx,
            event_loop_handle: Some(handle),
        })
    }
}

/// One rumqttc client plus the task polling its event loop
pub struct MqttConnection {
    id: ConnectionId,
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl Connection for MqttConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if self.event_loop_handle.is_none() {
            return Err(TransportError::Closed);
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        debug!(connection_id = self.id, topic, "Subscription requested");
        Ok(())
    }

    async fn close(&mut self) {
        let Some(handle) = self.event_loop_handle.take() else {
            return;
        };

        // Queue DISCONNECT first; the event loop flushes it while draining.
        if let Err(e) = self.client.try_disconnect() {
            debug!(connection_id = self.id, "DISCONNECT not queued: {}", e);
        }
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(CLOSE_GRACE * 2, handle).await {
            Ok(Ok(())) => debug!(connection_id = self.id, "Event loop task shut down gracefully"),
            Ok(Err(e)) => warn!(connection_id = self.id, "Event loop task failed: {}", e),
            Err(_) => warn!(connection_id = self.id, "Event loop task did not stop in time"),
        }
        info!(connection_id = self.id, "MQTT connection closed");
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop_handle.take() {
            let _ = self.shutdown_tx.send(true);
            handle.abort();
        }
    }
}

/// Poll the event loop until the connection ends or a close is requested.
///
/// Emits at most one terminal event (`ConnectFailed` or `Disconnected`) and
/// nothing at all once a close has been requested.
async fn drive_event_loop(
    connection_id: ConnectionId,
    mut event_loop: EventLoop,
    events: EventSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut acknowledged = false;

    loop {
        let polled = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                drain_until_disconnect(connection_id, &mut event_loop).await;
                break;
            }
            polled = event_loop.poll() => polled,
        };

        if *shutdown_rx.borrow() {
            drain_until_disconnect(connection_id, &mut event_loop).await;
            break;
        }

        let (kind, terminal) = match polled {
            Ok(event) => match route_event(connection_id, &event, &mut acknowledged) {
                Some(routed) => routed,
                None => continue,
            },
            Err(e) => {
                let kind = if acknowledged {
                    error!(connection_id, "MQTT connection lost: {}", e);
                    TransportEventKind::Disconnected(e.to_string())
                } else {
                    let failure = MessageHandler::classify_connection_error(&e);
                    warn!(connection_id, "MQTT handshake failed: {}", failure);
                    TransportEventKind::ConnectFailed(failure)
                };
                (kind, true)
            }
        };

        if events
            .send(TransportEvent::new(connection_id, kind))
            .await
            .is_err()
        {
            debug!(connection_id, "Session no longer listening, stopping event loop");
            break;
        }
        if terminal {
            break;
        }
    }

    debug!(connection_id, "MQTT event loop stopped");
}

/// Map one polled event; `None` means nothing for the session to see
fn route_event(
    connection_id: ConnectionId,
    event: &Event,
    acknowledged: &mut bool,
) -> Option<(TransportEventKind, bool)> {
    match MessageHandler::route_mqtt_event(event) {
        EventRoute::ConnectionAcknowledged => {
            *acknowledged = true;
            info!(connection_id, "MQTT connection acknowledged");
            Some((TransportEventKind::ConnAck, false))
        }
        EventRoute::ConnectionRefused(code) => {
            let failure = MessageHandler::classify_return_code(code);
            warn!(connection_id, "MQTT connection refused: {}", failure);
            Some((TransportEventKind::ConnectFailed(failure), true))
        }
        EventRoute::MessageReceived { topic, payload } => {
            debug!(connection_id, %topic, bytes = payload.len(), "Message received");
            Some((TransportEventKind::Delivery { topic, payload }, false))
        }
        EventRoute::SubscriptionConfirmed {
            packet_id,
            return_codes,
        } => {
            debug!(connection_id, packet_id, ?return_codes, "Subscription acknowledged");
            Some((MessageHandler::suback_event(&return_codes), false))
        }
        EventRoute::Disconnected => {
            warn!(connection_id, "Broker sent DISCONNECT");
            Some((
                TransportEventKind::Disconnected("Broker sent DISCONNECT".to_string()),
                true,
            ))
        }
        EventRoute::InfrastructureEvent(description) => {
            trace!(connection_id, "MQTT event: {}", description);
            None
        }
        EventRoute::OutgoingEvent => None,
    }
}

/// Keep polling briefly so a queued DISCONNECT reaches the broker
async fn drain_until_disconnect(connection_id: ConnectionId, event_loop: &mut EventLoop) {
    let drained = tokio::time::timeout(CLOSE_GRACE, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!(connection_id, "DISCONNECT not flushed before grace period ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Credential;
    use tokio::sync::mpsc;

    fn request(connection_id: ConnectionId) -> ConnectRequest {
        ConnectRequest {
            connection_id,
            device_id: "device-1".to_string(),
            credential: Credential::new("127.0.0.1", "token", 3600.0),
            // Nothing listens on port 1; the handshake fails fast.
            port: 1,
            keep_alive: Duration::from_secs(30),
            api_version: "2021-04-12".to_string(),
        }
    }

    #[test]
    fn test_route_event_tracks_acknowledgement() {
        use rumqttc::{ConnAck, ConnectReturnCode, Packet};

        let mut acknowledged = false;
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            route_event(3, &connack, &mut acknowledged),
            Some((TransportEventKind::ConnAck, false))
        );
        assert!(acknowledged);

        let ping = Event::Incoming(Packet::PingResp);
        assert_eq!(route_event(3, &ping, &mut acknowledged), None);
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_connect_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = MqttTransport::new();
        let mut connection = transport.open(request(42), tx).await.unwrap();
        assert_eq!(connection.id(), 42);

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.connection_id, 42);
        assert!(matches!(
            event.kind,
            TransportEventKind::ConnectFailed(crate::transport::ConnectFailure::Transport(_))
        ));

        connection.close().await;
        assert!(matches!(
            connection.subscribe("devices/device-1/messages/devicebound/#").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_options() {
        let (tx, _rx) = mpsc::channel(8);
        let mut req = request(1);
        req.credential.broker_host.clear();
        let result = MqttTransport::new().open(req, tx).await;
        assert!(matches!(result, Err(TransportError::InvalidOptions(_))));
    }
}
