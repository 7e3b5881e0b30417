//! rumqttc-backed transport for the IoT-hub broker
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - pure MQTT option construction
//! - [`message_handler`] - pure routing of rumqttc events
//! - [`client`] - the connection task and the [`Transport`](crate::transport::Transport) impl

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnection, MqttTransport};
pub use connection::{configure_mqtt_options, MAX_PACKET_SIZE};
pub use message_handler::{EventRoute, MessageHandler};
