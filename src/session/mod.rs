//! Broker session lifecycle
//!
//! - [`state`] - the pure state machine
//! - [`policy`] - reconnect timing and the retry cap
//! - [`manager`] - the worker task that drives both against a transport

pub mod manager;
pub mod policy;
pub mod state;

pub use manager::{SessionManager, SessionSettings};
pub use policy::{ReconnectPolicy, ReconnectionDecision};
pub use state::{SessionAction, SessionEvent, SessionMachine, SessionState};
