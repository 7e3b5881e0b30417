//! Pure session state machine
//!
//! [`SessionMachine::handle`] takes one event and returns the actions the
//! owning task must perform, in order. It does no I/O and never looks at a
//! clock, so every transition can be exercised directly in tests.

use super::policy::{ReconnectPolicy, ReconnectionDecision};
use crate::transport::ConnectFailure;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle of one session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    /// Not started
    Idle,
    /// Waiting for the credential resolver
    ResolvingCredential,
    /// Handshake in flight
    Connecting,
    /// Handshake accepted; subscription requested or acknowledged
    Connected,
    /// Retry cap exhausted; only `Stop` leaves this state
    Disconnected,
    /// One reconnect timer outstanding
    ReconnectScheduled,
    /// Terminal
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::ResolvingCredential => "resolving_credential",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::ReconnectScheduled => "reconnect_scheduled",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start,
    CredentialResolved,
    CredentialFailed(String),
    HandshakeSucceeded,
    HandshakeFailed(ConnectFailure),
    /// No acknowledgement within the connect timeout
    HandshakeTimedOut,
    SubscribeSucceeded,
    SubscribeFailed(String),
    ConnectionLost(String),
    ReconnectTimerFired,
    Stop,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    ResolveCredential { force: bool },
    OpenConnection,
    Subscribe,
    CloseConnection,
    InvalidateCache,
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelReconnect,
    NotifyStatus { connected: bool },
    /// Hand deliveries held back before the SubAck to the pipeline
    FlushDeliveries,
}

/// Session state plus the bookkeeping its transitions depend on
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    policy: ReconnectPolicy,
    consecutive_failures: u32,
    force_next_resolve: bool,
    subscribed: bool,
}

impl SessionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: SessionState::Idle,
            policy,
            consecutive_failures: 0,
            force_next_resolve: false,
            subscribed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True while a ConnAck or SubAck is outstanding
    pub fn awaiting_ack(&self) -> bool {
        match self.state {
            SessionState::Connecting => true,
            SessionState::Connected => !self.subscribed,
            _ => false,
        }
    }

    /// Whether inbound deliveries should reach the pipeline now
    pub fn accepts_deliveries(&self) -> bool {
        self.state == SessionState::Connected && self.subscribed
    }

    /// Whether inbound deliveries must be held until the SubAck arrives
    pub fn holds_deliveries(&self) -> bool {
        self.state == SessionState::Connected && !self.subscribed
    }

    /// Return a stopped machine to `Idle`; any other state is left alone
    pub fn reset(&mut self) -> bool {
        if self.state != SessionState::Stopped {
            return false;
        }
        *self = Self::new(self.policy.clone());
        true
    }

    /// Apply one event; events that do not apply to the current state are ignored
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        use SessionAction as A;
        use SessionState as S;

        match (self.state, event) {
            (S::Stopped, _) => Vec::new(),

            (_, SessionEvent::Stop) => {
                let was_connected = self.state == S::Connected;
                self.state = S::Stopped;
                let mut actions = vec![A::CancelReconnect, A::CloseConnection];
                if was_connected {
                    actions.push(A::NotifyStatus { connected: false });
                }
                actions
            }

            (S::Idle, SessionEvent::Start) => self.begin_resolve(),

            (S::ResolvingCredential, SessionEvent::CredentialResolved) => {
                self.state = S::Connecting;
                self.subscribed = false;
                vec![A::OpenConnection]
            }
            (S::ResolvingCredential, SessionEvent::CredentialFailed(reason)) => {
                warn!("Credential resolution failed: {}", reason);
                self.fail(Vec::new())
            }

            (S::Connecting, SessionEvent::HandshakeSucceeded) => {
                self.state = S::Connected;
                vec![A::NotifyStatus { connected: true }, A::Subscribe]
            }
            (S::Connecting, SessionEvent::HandshakeFailed(ConnectFailure::AuthRejected(reason))) => {
                warn!("Broker rejected credential: {}", reason);
                self.force_next_resolve = true;
                self.fail(vec![A::CloseConnection, A::InvalidateCache])
            }
            (S::Connecting, SessionEvent::HandshakeFailed(ConnectFailure::Transport(reason))) => {
                warn!("Handshake failed: {}", reason);
                self.fail(vec![A::CloseConnection])
            }
            (S::Connecting, SessionEvent::HandshakeTimedOut) => {
                warn!("Handshake timed out");
                self.fail(vec![A::CloseConnection])
            }
            (S::Connecting, SessionEvent::ConnectionLost(reason)) => {
                warn!("Connection lost during handshake: {}", reason);
                self.fail(vec![A::CloseConnection])
            }

            (S::Connected, SessionEvent::SubscribeSucceeded) if !self.subscribed => {
                self.subscribed = true;
                self.consecutive_failures = 0;
                info!("Subscribed to devicebound messages");
                vec![A::FlushDeliveries]
            }
            (S::Connected, SessionEvent::SubscribeFailed(reason)) if !self.subscribed => {
                warn!("Subscription failed: {}", reason);
                self.fail(vec![A::CloseConnection, A::NotifyStatus { connected: false }])
            }
            (S::Connected, SessionEvent::HandshakeTimedOut) if !self.subscribed => {
                warn!("Subscription acknowledgement timed out");
                self.fail(vec![A::CloseConnection, A::NotifyStatus { connected: false }])
            }
            (S::Connected, SessionEvent::ConnectionLost(reason)) => {
                warn!("Connection lost: {}", reason);
                self.fail(vec![A::CloseConnection, A::NotifyStatus { connected: false }])
            }

            (S::ReconnectScheduled, SessionEvent::ReconnectTimerFired) => self.begin_resolve(),

            (_, _) => Vec::new(),
        }
    }

    fn begin_resolve(&mut self) -> Vec<SessionAction> {
        self.state = SessionState::ResolvingCredential;
        let force = std::mem::take(&mut self.force_next_resolve);
        vec![SessionAction::ResolveCredential { force }]
    }

    /// Funnel every failure into the same retry decision
    fn fail(&mut self, mut actions: Vec<SessionAction>) -> Vec<SessionAction> {
        self.subscribed = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match self.policy.decide(self.consecutive_failures) {
            ReconnectionDecision::Proceed { attempt, delay } => {
                info!(
                    "Reconnection {}/{} scheduled in {:?}",
                    attempt,
                    self.policy.max_display(),
                    delay
                );
                self.state = SessionState::ReconnectScheduled;
                actions.push(SessionAction::ScheduleReconnect { attempt, delay });
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(
                    "Giving up after {} consecutive failures",
                    self.consecutive_failures
                );
                self.state = SessionState::Disconnected;
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn machine() -> SessionMachine {
        SessionMachine::new(ReconnectPolicy::new(Duration::from_secs(5), None))
    }

    fn connected() -> SessionMachine {
        let mut m = machine();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::CredentialResolved);
        m.handle(SessionEvent::HandshakeSucceeded);
        m.handle(SessionEvent::SubscribeSucceeded);
        assert_eq!(m.state(), SessionState::Connected);
        m
    }

    fn schedule(attempt: u32) -> SessionAction {
        SessionAction::ScheduleReconnect {
            attempt,
            delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut m = machine();
        assert_eq!(
            m.handle(SessionEvent::Start),
            vec![SessionAction::ResolveCredential { force: false }]
        );
        assert_eq!(m.state(), SessionState::ResolvingCredential);

        assert_eq!(
            m.handle(SessionEvent::CredentialResolved),
            vec![SessionAction::OpenConnection]
        );
        assert_eq!(m.state(), SessionState::Connecting);
        assert!(m.awaiting_ack());

        assert_eq!(
            m.handle(SessionEvent::HandshakeSucceeded),
            vec![
                SessionAction::NotifyStatus { connected: true },
                SessionAction::Subscribe
            ]
        );
        assert_eq!(m.state(), SessionState::Connected);
        assert!(m.awaiting_ack());
        assert!(m.holds_deliveries());
        assert!(!m.accepts_deliveries());

        assert_eq!(
            m.handle(SessionEvent::SubscribeSucceeded),
            vec![SessionAction::FlushDeliveries]
        );
        assert!(!m.awaiting_ack());
        assert!(!m.holds_deliveries());
        assert!(m.accepts_deliveries());
    }

    #[test]
    fn test_resolve_failure_schedules_reconnect() {
        let mut m = machine();
        m.handle(SessionEvent::Start);
        assert_eq!(
            m.handle(SessionEvent::CredentialFailed("offline".into())),
            vec![schedule(1)]
        );
        assert_eq!(m.state(), SessionState::ReconnectScheduled);

        assert_eq!(
            m.handle(SessionEvent::ReconnectTimerFired),
            vec![SessionAction::ResolveCredential { force: false }]
        );
    }

    #[test]
    fn test_auth_rejection_invalidates_then_forces_refresh() {
        let mut m = machine();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::CredentialResolved);

        let actions = m.handle(SessionEvent::HandshakeFailed(ConnectFailure::AuthRejected(
            "NotAuthorized".into(),
        )));
        assert_eq!(
            actions,
            vec![
                SessionAction::CloseConnection,
                SessionAction::InvalidateCache,
                schedule(1)
            ]
        );

        assert_eq!(
            m.handle(SessionEvent::ReconnectTimerFired),
            vec![SessionAction::ResolveCredential { force: true }]
        );

        // The force flag applies to one resolve only
        m.handle(SessionEvent::CredentialFailed("offline".into()));
        assert_eq!(
            m.handle(SessionEvent::ReconnectTimerFired),
            vec![SessionAction::ResolveCredential { force: false }]
        );
    }

    #[test]
    fn test_transport_failure_keeps_cache() {
        let mut m = machine();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::CredentialResolved);
        let actions = m.handle(SessionEvent::HandshakeFailed(ConnectFailure::Transport(
            "tls".into(),
        )));
        assert!(!actions.contains(&SessionAction::InvalidateCache));
        assert_eq!(m.state(), SessionState::ReconnectScheduled);
    }

    #[test]
    fn test_subscribe_failure_schedules_reconnect() {
        let mut m = machine();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::CredentialResolved);
        m.handle(SessionEvent::HandshakeSucceeded);

        let actions = m.handle(SessionEvent::SubscribeFailed("refused".into()));
        assert_eq!(
            actions,
            vec![
                SessionAction::CloseConnection,
                SessionAction::NotifyStatus { connected: false },
                schedule(1)
            ]
        );
        assert_eq!(m.state(), SessionState::ReconnectScheduled);
    }

    #[test]
    fn test_handshake_timeout_in_both_phases() {
        let mut m = machine();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::CredentialResolved);
        m.handle(SessionEvent::HandshakeTimedOut);
        assert_eq!(m.state(), SessionState::ReconnectScheduled);

        m.handle(SessionEvent::ReconnectTimerFired);
        m.handle(SessionEvent::CredentialResolved);
        m.handle(SessionEvent::HandshakeSucceeded);
        m.handle(SessionEvent::HandshakeTimedOut);
        assert_eq!(m.state(), SessionState::ReconnectScheduled);

        // A late timeout after the subscription landed is ignored
        let mut m = connected();
        assert!(m.handle(SessionEvent::HandshakeTimedOut).is_empty());
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn test_double_disconnect_schedules_one_timer() {
        let mut m = connected();
        let first = m.handle(SessionEvent::ConnectionLost("reset".into()));
        let second = m.handle(SessionEvent::ConnectionLost("reset again".into()));

        assert_eq!(
            first,
            vec![
                SessionAction::CloseConnection,
                SessionAction::NotifyStatus { connected: false },
                schedule(1)
            ]
        );
        assert!(second.is_empty());
        assert_eq!(m.state(), SessionState::ReconnectScheduled);
    }

    #[test]
    fn test_successful_subscribe_resets_failure_count() {
        let mut m = connected();
        m.handle(SessionEvent::ConnectionLost("reset".into()));
        m.handle(SessionEvent::ReconnectTimerFired);
        m.handle(SessionEvent::CredentialFailed("offline".into()));
        assert_eq!(m.consecutive_failures(), 2);

        m.handle(SessionEvent::ReconnectTimerFired);
        m.handle(SessionEvent::CredentialResolved);
        m.handle(SessionEvent::HandshakeSucceeded);
        m.handle(SessionEvent::SubscribeSucceeded);
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[test]
    fn test_retry_cap_moves_to_disconnected() {
        let mut m = SessionMachine::new(ReconnectPolicy::new(Duration::from_secs(1), Some(1)));
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::CredentialFailed("offline".into()));
        assert_eq!(m.state(), SessionState::ReconnectScheduled);

        m.handle(SessionEvent::ReconnectTimerFired);
        assert!(m
            .handle(SessionEvent::CredentialFailed("offline".into()))
            .is_empty());
        assert_eq!(m.state(), SessionState::Disconnected);

        assert!(m.handle(SessionEvent::ReconnectTimerFired).is_empty());
        m.handle(SessionEvent::Stop);
        assert_eq!(m.state(), SessionState::Stopped);
    }

    #[test]
    fn test_stop_is_terminal_and_idempotent() {
        let mut m = connected();
        assert_eq!(
            m.handle(SessionEvent::Stop),
            vec![
                SessionAction::CancelReconnect,
                SessionAction::CloseConnection,
                SessionAction::NotifyStatus { connected: false }
            ]
        );
        assert!(m.handle(SessionEvent::Stop).is_empty());
        assert!(m.handle(SessionEvent::Start).is_empty());
        assert!(m.handle(SessionEvent::ConnectionLost("late".into())).is_empty());
        assert_eq!(m.state(), SessionState::Stopped);
    }

    #[test]
    fn test_stop_from_idle_and_reset() {
        let mut m = machine();
        assert!(!m.reset());
        m.handle(SessionEvent::Stop);
        assert_eq!(m.state(), SessionState::Stopped);

        assert!(m.reset());
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(
            m.handle(SessionEvent::Start),
            vec![SessionAction::ResolveCredential { force: false }]
        );
    }

    #[test]
    fn test_stray_events_are_ignored() {
        let mut m = machine();
        assert!(m.handle(SessionEvent::ReconnectTimerFired).is_empty());
        assert!(m.handle(SessionEvent::HandshakeSucceeded).is_empty());
        assert_eq!(m.state(), SessionState::Idle);

        let mut m = connected();
        assert!(m.handle(SessionEvent::Start).is_empty());
        assert!(m.handle(SessionEvent::CredentialResolved).is_empty());
        assert!(m.handle(SessionEvent::SubscribeFailed("late".into())).is_empty());
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn test_deliveries_held_only_until_subscription_settles() {
        let mut m = machine();
        m.handle(SessionEvent::Start);
        m.handle(SessionEvent::CredentialResolved);
        assert!(!m.holds_deliveries());

        m.handle(SessionEvent::HandshakeSucceeded);
        assert!(m.holds_deliveries());

        m.handle(SessionEvent::HandshakeTimedOut);
        assert_eq!(m.state(), SessionState::ReconnectScheduled);
        assert!(!m.holds_deliveries());
        assert!(!m.accepts_deliveries());

        let mut m = connected();
        assert!(m.handle(SessionEvent::SubscribeSucceeded).is_empty());
        assert!(m.accepts_deliveries());
    }

    fn any_event() -> impl Strategy<Value = SessionEvent> {
        prop_oneof![
            Just(SessionEvent::Start),
            Just(SessionEvent::CredentialResolved),
            Just(SessionEvent::CredentialFailed("x".into())),
            Just(SessionEvent::HandshakeSucceeded),
            Just(SessionEvent::HandshakeFailed(ConnectFailure::AuthRejected(
                "x".into()
            ))),
            Just(SessionEvent::HandshakeFailed(ConnectFailure::Transport("x".into()))),
            Just(SessionEvent::HandshakeTimedOut),
            Just(SessionEvent::SubscribeSucceeded),
            Just(SessionEvent::SubscribeFailed("x".into())),
            Just(SessionEvent::ConnectionLost("x".into())),
            Just(SessionEvent::ReconnectTimerFired),
        ]
    }

    proptest! {
        #[test]
        fn prop_never_two_connection_attempts(events in proptest::collection::vec(any_event(), 0..200)) {
            let mut m = machine();
            let mut open = false;
            let mut timers = 0u32;
            let mut previous = m.state();

            for event in events {
                let actions = m.handle(event);
                for action in &actions {
                    match action {
                        SessionAction::OpenConnection => {
                            prop_assert!(!open, "second connection opened while one is live");
                            open = true;
                        }
                        SessionAction::CloseConnection => open = false,
                        SessionAction::ScheduleReconnect { .. } => timers += 1,
                        SessionAction::ResolveCredential { .. } => {
                            prop_assert!(timers <= 1);
                            timers = 0;
                        }
                        _ => {}
                    }
                }
                prop_assert!(timers <= 1, "more than one reconnect timer outstanding");

                let current = m.state();
                if previous == SessionState::Connecting && current == SessionState::Connecting {
                    prop_assert!(!actions.contains(&SessionAction::OpenConnection));
                }
                previous = current;
            }
        }

        #[test]
        fn prop_auth_rejection_invalidates_before_next_resolve(events in proptest::collection::vec(any_event(), 0..200)) {
            let mut m = machine();
            let mut pending_invalidate = false;

            for event in events {
                let auth_rejected = m.state() == SessionState::Connecting
                    && matches!(event, SessionEvent::HandshakeFailed(ConnectFailure::AuthRejected(_)));
                let actions = m.handle(event);

                if auth_rejected {
                    pending_invalidate = true;
                }
                for action in &actions {
                    match action {
                        SessionAction::InvalidateCache => pending_invalidate = false,
                        SessionAction::ResolveCredential { .. } => {
                            prop_assert!(!pending_invalidate);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
