//! Wire types and topic naming for the IoT-hub session
//!
//! Everything that crosses a process boundary (registration response,
//! persisted cache record, inbound notification, reply body) is defined here.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
