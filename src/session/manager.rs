//! Session manager: the single task that owns the broker connection
//!
//! All state transitions happen on one spawned worker. Transport completions,
//! the reconnect timer, the acknowledgement deadline and the stop signal are
//! all funnelled into that worker's `select!` loop and handled one at a time.

use super::policy::ReconnectPolicy;
use super::state::{SessionAction, SessionEvent, SessionMachine, SessionState};
use crate::config::SessionSection;
use crate::credentials::CredentialResolver;
use crate::error::{sanitize_error_message, SessionError, SessionResult};
use crate::events::{ConnectionStatus, EventBus, OverflowPolicy, Subscription};
use crate::identity::validate_device_id;
use crate::pipeline::MessagePipeline;
use crate::protocol::{devicebound_topic, is_devicebound_topic, Credential, Notification};
use crate::session_span;
use crate::transport::{
    ConnectFailure, ConnectRequest, Connection, ConnectionId, EventSender, Transport,
    TransportEvent, TransportEventKind,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Buffered transport events between driver tasks and the worker
const TRANSPORT_EVENT_CAPACITY: usize = 64;

/// Buffered connection-status events per subscriber
const STATUS_CAPACITY: usize = 16;

/// Buffered state transitions per `state_changes` receiver
const TRANSITION_CAPACITY: usize = 64;

/// How long `stop` waits for the worker before aborting it
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters for one session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub keep_alive: Duration,
    /// Deadline for each ConnAck and SubAck
    pub connect_timeout: Duration,
    pub broker_port: u16,
    pub api_version: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SessionSection::default())
    }
}

impl SessionSettings {
    pub fn from_config(section: &SessionSection) -> Self {
        Self {
            keep_alive: section.keep_alive(),
            connect_timeout: section.connect_timeout(),
            broker_port: section.broker_port,
            api_version: section.api_version.clone(),
            reconnect: ReconnectPolicy::from_config(section),
        }
    }
}

/// Public handle; the state machine itself lives on the worker task
pub struct SessionManager<T: Transport> {
    settings: SessionSettings,
    resolver: CredentialResolver,
    transport: Arc<T>,
    pipeline: MessagePipeline,
    status: EventBus<ConnectionStatus>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    credential_tx: Arc<watch::Sender<Option<Credential>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(
        settings: SessionSettings,
        resolver: CredentialResolver,
        transport: T,
        notifications: EventBus<Notification>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (credential_tx, _) = watch::channel(None);

        Self {
            settings,
            resolver,
            transport: Arc::new(transport),
            pipeline: MessagePipeline::new(notifications),
            status: EventBus::new(STATUS_CAPACITY, OverflowPolicy::DropOldest),
            state_tx: Arc::new(state_tx),
            state_rx,
            transitions,
            credential_tx: Arc::new(credential_tx),
            shutdown_tx: None,
            worker: None,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Latest state, updated on every transition
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Every state entered from now on, in order
    pub fn state_changes(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    /// Connected/disconnected transitions; slow readers lose the oldest
    pub fn status_events(&self) -> Subscription<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Decoded cloud-to-device notifications
    pub fn notifications(&self) -> Subscription<Notification> {
        self.pipeline.bus().subscribe()
    }

    /// The credential in use, if one has been resolved
    pub fn current_credential(&self) -> Option<Credential> {
        self.credential_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the worker and leave `Idle`
    pub fn start(&mut self) -> SessionResult<()> {
        match self.state() {
            SessionState::Stopped => return Err(SessionError::Stopped),
            SessionState::Idle if !self.is_running() => {}
            _ => return Err(SessionError::AlreadyRunning),
        }

        let device_id = self.resolver.identity().device_id().to_string();
        validate_device_id(&device_id)
            .map_err(|e| SessionError::missing_device_identity(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);

        let worker = SessionWorker {
            machine: SessionMachine::new(self.settings.reconnect.clone()),
            topic: devicebound_topic(&device_id),
            device_id: device_id.clone(),
            settings: self.settings.clone(),
            resolver: self.resolver.clone(),
            transport: self.transport.clone(),
            pipeline: self.pipeline.clone(),
            status: self.status.clone(),
            state_tx: self.state_tx.clone(),
            transitions: self.transitions.clone(),
            credential_tx: self.credential_tx.clone(),
            events_tx,
            events_rx,
            shutdown_rx,
            connection: None,
            held_deliveries: VecDeque::new(),
            next_connection_id: 0,
            reconnect_at: None,
            ack_deadline: None,
        };

        info!(device_id = %device_id, "Starting session manager");
        let span = session_span!(device_id = %device_id);
        self.worker = Some(tokio::spawn(worker.run().instrument(span)));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop the session. Idempotent; returns once the connection is released.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            if let Some(shutdown_tx) = &self.shutdown_tx {
                let _ = shutdown_tx.send(true);
                debug!("Sent shutdown signal to session worker");
            }

            let abort = handle.abort_handle();
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => info!("Session worker shut down gracefully"),
                Ok(Err(e)) => warn!("Session worker task failed: {}", e),
                Err(_) => {
                    warn!("Session worker did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        self.shutdown_tx = None;

        if self.state() != SessionState::Stopped {
            self.state_tx.send_replace(SessionState::Stopped);
            let _ = self.transitions.send(SessionState::Stopped);
        }
    }

    /// Return a stopped manager to `Idle` so it can be started again
    pub fn reset(&mut self) -> SessionResult<()> {
        match self.state() {
            SessionState::Stopped => {
                self.worker = None;
                self.shutdown_tx = None;
                self.credential_tx.send_replace(None);
                self.state_tx.send_replace(SessionState::Idle);
                let _ = self.transitions.send(SessionState::Idle);
                Ok(())
            }
            SessionState::Idle if !self.is_running() => Ok(()),
            _ => Err(SessionError::AlreadyRunning),
        }
    }
}

/// Single owner of the state machine and the live connection
struct SessionWorker<T: Transport> {
    machine: SessionMachine,
    device_id: String,
    topic: String,
    settings: SessionSettings,
    resolver: CredentialResolver,
    transport: Arc<T>,
    pipeline: MessagePipeline,
    status: EventBus<ConnectionStatus>,
    state_tx: Arc<watch::Sender<SessionState>>,
    transitions: broadcast::Sender<SessionState>,
    credential_tx: Arc<watch::Sender<Option<Credential>>>,
    events_tx: EventSender,
    events_rx: mpsc::Receiver<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
    connection: Option<T::Connection>,
    /// Deliveries that arrived between ConnAck and SubAck on the live connection
    held_deliveries: VecDeque<Bytes>,
    next_connection_id: ConnectionId,
    reconnect_at: Option<Instant>,
    ack_deadline: Option<Instant>,
}

impl<T: Transport> SessionWorker<T> {
    async fn run(mut self) {
        self.apply(SessionEvent::Start).await;

        while self.machine.state() != SessionState::Stopped {
            if let Some(event) = self.next_event().await {
                self.apply(event).await;
            }
        }

        info!("Session worker stopped");
    }

    /// Wait for the next input; `None` means the wake-up needs no transition
    async fn next_event(&mut self) -> Option<SessionEvent> {
        if *self.shutdown_rx.borrow() {
            return Some(SessionEvent::Stop);
        }

        let reconnect_at = self.reconnect_at;
        let ack_deadline = self.ack_deadline.filter(|_| self.machine.awaiting_ack());

        let wake = tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => Wake::Shutdown,
            _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)),
                if reconnect_at.is_some() => Wake::ReconnectTimer,
            _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)),
                if ack_deadline.is_some() => Wake::AckDeadline,
            received = self.events_rx.recv() => match received {
                Some(event) => Wake::Transport(event),
                // The worker holds a sender, so the channel never closes while it runs.
                None => Wake::Shutdown,
            },
        };

        match wake {
            Wake::Shutdown => Some(SessionEvent::Stop),
            Wake::ReconnectTimer => {
                self.reconnect_at = None;
                Some(SessionEvent::ReconnectTimerFired)
            }
            Wake::AckDeadline => {
                self.ack_deadline = None;
                Some(SessionEvent::HandshakeTimedOut)
            }
            Wake::Transport(event) => self.route_transport_event(event).await,
        }
    }

    /// Translate a transport event, discarding events from superseded connections
    async fn route_transport_event(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        let current = self.connection.as_ref().map(|c| c.id());
        if current != Some(event.connection_id) {
            debug!(
                connection_id = event.connection_id,
                current = ?current,
                "Discarding event from stale connection"
            );
            return None;
        }

        match event.kind {
            TransportEventKind::ConnAck => Some(SessionEvent::HandshakeSucceeded),
            TransportEventKind::ConnectFailed(failure) => {
                Some(SessionEvent::HandshakeFailed(failure))
            }
            TransportEventKind::SubAck => Some(SessionEvent::SubscribeSucceeded),
            TransportEventKind::SubscribeRejected(reason) => {
                Some(SessionEvent::SubscribeFailed(reason))
            }
            TransportEventKind::Disconnected(reason) => Some(SessionEvent::ConnectionLost(reason)),
            TransportEventKind::Delivery { topic, payload } => {
                self.deliver(&topic, payload).await
            }
        }
    }

    async fn deliver(&mut self, topic: &str, payload: Bytes) -> Option<SessionEvent> {
        let hold = self.machine.holds_deliveries();
        if !hold && !self.machine.accepts_deliveries() {
            debug!(state = %self.machine.state(), "Ignoring delivery outside Connected");
            return None;
        }
        if !is_devicebound_topic(topic, &self.device_id) {
            warn!(%topic, "Ignoring delivery on unexpected topic");
            return None;
        }

        if hold {
            self.held_deliveries.push_back(payload);
            debug!(
                held = self.held_deliveries.len(),
                "Holding delivery until subscription is acknowledged"
            );
            return None;
        }

        self.publish(&payload).await
    }

    /// Run one payload through the pipeline unless a stop arrives first
    async fn publish(&mut self, payload: &[u8]) -> Option<SessionEvent> {
        tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => Some(SessionEvent::Stop),
            _ = self.pipeline.on_delivery(payload) => None,
        }
    }

    /// Run one event and every follow-up it produces to completion
    async fn apply(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let from = self.machine.state();
            let actions = self.machine.handle(event);
            let to = self.machine.state();

            if from != to {
                info!(%from, %to, "Session state changed");
                self.state_tx.send_replace(to);
                let _ = self.transitions.send(to);
            }

            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, action: SessionAction) -> Option<SessionEvent> {
        match action {
            SessionAction::ResolveCredential { force } => self.resolve(force).await,
            SessionAction::OpenConnection => self.open_connection().await,
            SessionAction::Subscribe => self.subscribe().await,
            SessionAction::CloseConnection => {
                if !self.held_deliveries.is_empty() {
                    warn!(
                        discarded = self.held_deliveries.len(),
                        "Discarding deliveries held for an unacknowledged subscription"
                    );
                    self.held_deliveries.clear();
                }
                if let Some(mut connection) = self.connection.take() {
                    connection.close().await;
                }
                None
            }
            SessionAction::InvalidateCache => {
                self.resolver.invalidate().await;
                None
            }
            SessionAction::ScheduleReconnect { attempt, delay } => {
                debug!(attempt, ?delay, "Reconnect timer armed");
                self.reconnect_at = Some(Instant::now() + delay);
                None
            }
            SessionAction::CancelReconnect => {
                self.reconnect_at = None;
                None
            }
            SessionAction::NotifyStatus { connected } => {
                self.status.publish(ConnectionStatus::now(connected)).await;
                None
            }
            SessionAction::FlushDeliveries => {
                if !self.held_deliveries.is_empty() {
                    debug!(count = self.held_deliveries.len(), "Flushing held deliveries");
                }
                while let Some(payload) = self.held_deliveries.pop_front() {
                    if let Some(stop) = self.publish(&payload).await {
                        return Some(stop);
                    }
                }
                None
            }
        }
    }

    async fn resolve(&mut self, force: bool) -> Option<SessionEvent> {
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => return Some(SessionEvent::Stop),
            outcome = self.resolver.resolve(force) => outcome,
        };

        match outcome {
            Ok(credential) => {
                self.credential_tx.send_replace(Some(credential));
                Some(SessionEvent::CredentialResolved)
            }
            Err(e) => Some(SessionEvent::CredentialFailed(sanitize_error_message(
                &e.to_string(),
            ))),
        }
    }

    async fn open_connection(&mut self) -> Option<SessionEvent> {
        let credential = self.credential_tx.borrow().clone();
        let Some(credential) = credential else {
            return Some(SessionEvent::HandshakeFailed(ConnectFailure::Transport(
                "No credential resolved".to_string(),
            )));
        };

        self.next_connection_id += 1;
        let request = ConnectRequest {
            connection_id: self.next_connection_id,
            device_id: self.device_id.clone(),
            credential,
            port: self.settings.broker_port,
            keep_alive: self.settings.keep_alive,
            api_version: self.settings.api_version.clone(),
        };

        self.ack_deadline = Some(Instant::now() + self.settings.connect_timeout);
        match self.transport.open(request, self.events_tx.clone()).await {
            Ok(connection) => {
                self.connection = Some(connection);
                None
            }
            Err(e) => Some(SessionEvent::HandshakeFailed(ConnectFailure::Transport(
                e.to_string(),
            ))),
        }
    }

    async fn subscribe(&mut self) -> Option<SessionEvent> {
        self.ack_deadline = Some(Instant::now() + self.settings.connect_timeout);
        let Some(connection) = self.connection.as_mut() else {
            return Some(SessionEvent::SubscribeFailed(
                "No live connection".to_string(),
            ));
        };

        match connection.subscribe(&self.topic).await {
            Ok(()) => None,
            Err(e) => Some(SessionEvent::SubscribeFailed(e.to_string())),
        }
    }
}

enum Wake {
    Shutdown,
    ReconnectTimer,
    AckDeadline,
    Transport(TransportEvent),
}
