//! Pure MQTT option construction for IoT-hub connections

use crate::protocol::broker_username;
use crate::transport::{ConnectRequest, TransportError};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;

/// Largest cloud-to-device message the hub will deliver
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Smallest keep-alive rumqttc accepts
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Pure function to configure MQTT options for one connection attempt.
///
/// TLS is always on, the client id is the device id, the username is
/// `{host}/{device_id}/?api-version=...` and the password is the token. The
/// session is persistent so the broker queues devicebound messages while
/// the device is offline.
pub fn configure_mqtt_options(request: &ConnectRequest) -> Result<MqttOptions, TransportError> {
    let host = request.credential.broker_host.trim();
    if host.is_empty() {
        return Err(TransportError::InvalidOptions(
            "Broker host is empty".to_string(),
        ));
    }
    if host.contains("://") || host.contains('/') {
        return Err(TransportError::InvalidOptions(format!(
            "Broker host must be a bare host name: {host}"
        )));
    }
    if request.device_id.is_empty() {
        return Err(TransportError::InvalidOptions(
            "Device id is empty".to_string(),
        ));
    }
    if request.credential.auth_token.is_empty() {
        return Err(TransportError::InvalidOptions(
            "Credential token is empty".to_string(),
        ));
    }

    let mut mqtt_options = MqttOptions::new(request.device_id.clone(), host, request.port);
    mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    mqtt_options.set_credentials(
        broker_username(host, &request.device_id, &request.api_version),
        request.credential.auth_token.clone(),
    );
    mqtt_options.set_keep_alive(request.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_clean_session(false);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    Ok(mqtt_options)
}
