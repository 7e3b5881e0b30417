//! Observability for the session manager
//!
//! Structured logging only; connection health is exposed through the
//! session manager's own state and status events.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, session_span};
