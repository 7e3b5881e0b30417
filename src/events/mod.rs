//! Events handed to presentation collaborators
//!
//! Decoded notifications travel on an [`EventBus<Notification>`];
//! connection-status transitions on an [`EventBus<ConnectionStatus>`].
//!
//! ```rust
//! use hubsession::events::{EventBus, OverflowPolicy};
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new(4, OverflowPolicy::Block);
//! let mut subscription = bus.subscribe();
//! assert_eq!(bus.publish("ping").await, 1);
//! assert_eq!(subscription.recv().await, Some("ping"));
//! # });
//! ```

pub mod bus;

pub use bus::{EventBus, OverflowPolicy, Subscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection-status transition, timestamped when the session manager made it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub at: DateTime<Utc>,
}

impl ConnectionStatus {
    pub fn now(connected: bool) -> Self {
        Self {
            connected,
            at: Utc::now(),
        }
    }
}
