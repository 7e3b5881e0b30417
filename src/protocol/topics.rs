//! Topic and broker-login construction for the IoT-hub MQTT surface

/// Default API version appended to the MQTT username.
pub const DEFAULT_API_VERSION: &str = "2021-04-12";

/// Cloud-to-device subscription filter: `devices/{device_id}/messages/devicebound/#`
pub fn devicebound_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// MQTT username: `{host}/{device_id}/?api-version={version}`
pub fn broker_username(host: &str, device_id: &str, api_version: &str) -> String {
    format!("{host}/{device_id}/?api-version={api_version}")
}

/// Resource URI a shared access signature is scoped to: `{host}/devices/{device_id}`
pub fn device_resource_uri(host: &str, device_id: &str) -> String {
    format!("{host}/devices/{device_id}")
}

/// Check whether a concrete publish topic falls under the device's devicebound filter.
///
/// The hub appends URL-encoded property bags after the prefix, so only the
/// prefix is compared.
pub fn is_devicebound_topic(topic: &str, device_id: &str) -> bool {
    let prefix = format!("devices/{device_id}/messages/devicebound/");
    topic.starts_with(&prefix)
}
