//! Testing utilities and mock implementations
//!
//! Scriptable stand-ins for the broker transport, the registration endpoint
//! and the wall clock, so session behaviour can be exercised without a
//! network.

pub mod mocks;

pub use mocks::*;
