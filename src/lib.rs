//! hubsession - persistent IoT-hub device session
//!
//! Keeps one authenticated, subscribed MQTT session open to an IoT hub on
//! behalf of a device and turns cloud-to-device messages into
//! [`Notification`](protocol::Notification) events.
//!
//! # Overview
//!
//! - Credential acquisition with a durable single-slot cache
//!   ([`credentials`])
//! - A serialized session state machine with fixed-delay reconnect
//!   ([`session`])
//! - A pluggable transport, with a rumqttc implementation ([`transport`])
//! - Payload decoding ([`pipeline`]) and bounded fan-out ([`events`])
//! - Action replies back to the backend ([`reply`])
//!
//! # Quick Start
//!
//! ```rust
//! use hubsession::protocol::{devicebound_topic, Notification};
//!
//! let notification: Notification = serde_json::from_str(
//!     r#"{"id":7,"caption":"Alert","message":"Door open","buttons":["Ack","Snooze"]}"#,
//! )
//! .unwrap();
//! assert_eq!(notification.actions, vec!["Ack", "Snooze"]);
//! assert_eq!(
//!     devicebound_topic("device-1"),
//!     "devices/device-1/messages/devicebound/#"
//! );
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod identity;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod reply;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, HubConfig};
pub use credentials::{CredentialResolver, ResolveError};
pub use error::{SessionError, SessionResult};
pub use events::{ConnectionStatus, EventBus, OverflowPolicy, Subscription};
pub use identity::DeviceIdentity;
pub use pipeline::MessagePipeline;
pub use protocol::{CachedCredential, Credential, Notification};
pub use reply::{ReplyClient, ReplyError};
pub use session::{SessionManager, SessionSettings, SessionState};
pub use transport::mqtt::MqttTransport;
