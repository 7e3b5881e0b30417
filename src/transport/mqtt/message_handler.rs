//! Pure routing of rumqttc events into transport events

use crate::transport::{ConnectFailure, TransportEventKind};
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) if connack.code == ConnectReturnCode::Success => {
                    EventRoute::ConnectionAcknowledged
                }
                Packet::ConnAck(connack) => EventRoute::ConnectionRefused(connack.code),
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback.return_codes.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(
        return_codes: &[SubscribeReasonCode],
    ) -> Result<(), String> {
        if return_codes.is_empty() {
            return Err("SubAck carried no return codes".to_string());
        }
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ));
        }
        Ok(())
    }

    /// Classify a refused handshake by its return code (pure function)
    pub fn classify_return_code(code: ConnectReturnCode) -> ConnectFailure {
        match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ConnectFailure::AuthRejected(format!("{code:?}"))
            }
            other => ConnectFailure::Transport(format!("Connection refused: {other:?}")),
        }
    }

    /// Classify an event loop error raised before the handshake completed (pure function)
    pub fn classify_connection_error(error: &ConnectionError) -> ConnectFailure {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::classify_return_code(*code),
            other => ConnectFailure::Transport(other.to_string()),
        }
    }

    /// Map a subscription acknowledgement to the event the session sees (pure function)
    pub fn suback_event(return_codes: &[SubscribeReasonCode]) -> TransportEventKind {
        match Self::validate_subscription_success(return_codes) {
            Ok(()) => TransportEventKind::SubAck,
            Err(reason) => TransportEventKind::SubscribeRejected(reason),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged
    ConnectionAcknowledged,
    /// Broker answered the CONNECT with a refusal code
    ConnectionRefused(ConnectReturnCode),
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<SubscribeReasonCode>,
    },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
