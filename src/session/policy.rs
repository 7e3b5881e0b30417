//! Pure reconnection decision logic

use crate::config::SessionSection;
use std::time::Duration;

/// Fixed-delay retry schedule with an optional cap on consecutive failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait between a failure and the next attempt
    pub delay: Duration,
    /// Consecutive failures tolerated before giving up (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

/// Outcome of [`ReconnectPolicy::decide`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Schedule attempt number `attempt` after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Retry cap reached
    AbortMaxAttemptsExceeded,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    pub fn from_config(section: &SessionSection) -> Self {
        Self::new(section.reconnect_delay(), section.max_reconnect_attempts)
    }

    /// Decide what follows the `failures`-th consecutive failure (pure function)
    pub fn decide(&self, failures: u32) -> ReconnectionDecision {
        if let Some(max_attempts) = self.max_attempts {
            if failures > max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failures,
            delay: self.delay,
        }
    }

    /// Human-readable cap for logs
    pub fn max_display(&self) -> String {
        self.max_attempts
            .map_or("∞".to_string(), |max| max.to_string())
    }
}
