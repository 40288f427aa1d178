//! Connection lifecycle for the active session.
//!
//! [`ConnectionMachine`] is the pure state machine. [`ConnectionManager`]
//! drives it from transport work running on spawned tasks. Those tasks never
//! touch state directly: they post reports on a channel, and the owner applies
//! them by pumping [`ConnectionManager::next_events`] or
//! [`ConnectionManager::drain_events`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::profiles::{ConnectionProfile, ProfileError};
use crate::query_executor::QueryTransport;
use crate::session_store::SessionId;

/// Close code for a connection the client shut down itself.
pub const CLIENT_CLOSED_CODE: u16 = 1005;
pub const ABNORMAL_CLOSURE_CODE: u16 = 1006;
pub const INTERNAL_ERROR_CODE: u16 = 1011;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    code: u16,
    message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn abnormal(message: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE_CODE, message)
    }

    #[must_use]
    pub fn client_closed() -> Self {
        Self::new(CLIENT_CLOSED_CODE, "")
    }

    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_client_closed(&self) -> bool {
        self.code == CLIENT_CLOSED_CODE
    }

    /// Whether the transport is gone, as opposed to one request failing.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        self.code == ABNORMAL_CLOSURE_CODE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: HandleId,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Error { code: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub handle: ConnectionHandle,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInput {
    Open(ConnectionHandle),
    TransportOpened(HandleId),
    TransportFailed { handle: HandleId, error: TransportError },
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    current: Option<ConnectionHandle>,
}

impl ConnectionMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn current(&self) -> Option<ConnectionHandle> {
        self.current
    }

    /// Advances the machine. Transport inputs naming a handle other than the
    /// current one are stale and produce no events.
    pub fn apply(&mut self, input: ConnectionInput) -> Vec<ConnectionEvent> {
        match input {
            ConnectionInput::Open(handle) => {
                let events = self.apply(ConnectionInput::Close);
                self.state = ConnectionState::Connecting;
                self.current = Some(handle);
                events
            }
            ConnectionInput::TransportOpened(id) => match self.current {
                Some(handle)
                    if handle.id == id && self.state == ConnectionState::Connecting =>
                {
                    self.state = ConnectionState::Connected;
                    vec![ConnectionEvent {
                        handle,
                        kind: ConnectionEventKind::Connected,
                    }]
                }
                _ => Vec::new(),
            },
            ConnectionInput::TransportFailed { handle: id, error } => {
                let Some(handle) = self.current.filter(|handle| handle.id == id) else {
                    return Vec::new();
                };
                self.current = None;
                self.state = ConnectionState::Disconnected;

                let mut events = Vec::with_capacity(2);
                if !error.is_client_closed() {
                    events.push(ConnectionEvent {
                        handle,
                        kind: ConnectionEventKind::Error {
                            code: error.code(),
                            message: error.message().to_string(),
                        },
                    });
                }
                events.push(ConnectionEvent {
                    handle,
                    kind: ConnectionEventKind::Disconnected,
                });
                events
            }
            ConnectionInput::Close => {
                let Some(handle) = self.current.take() else {
                    return Vec::new();
                };
                self.state = ConnectionState::Disconnected;
                vec![ConnectionEvent {
                    handle,
                    kind: ConnectionEventKind::Disconnected,
                }]
            }
        }
    }
}

/// A connected transport bound to the handle it was opened under. Once that
/// handle stops being the live one the lease reports itself dead.
#[derive(Clone)]
pub struct ConnectionLease {
    handle: ConnectionHandle,
    transport: Arc<dyn QueryTransport>,
    live: Arc<AtomicU64>,
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("handle", &self.handle)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

impl ConnectionLease {
    /// Wraps an already-open transport that no manager tracks.
    #[must_use]
    pub fn detached(transport: Arc<dyn QueryTransport>) -> Self {
        Self {
            handle: ConnectionHandle {
                id: HandleId(1),
                session_id: SessionId::new(),
            },
            transport,
            live: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn QueryTransport> {
        &self.transport
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.handle.id.0
    }

    #[cfg(test)]
    pub(crate) fn revoke(&self) {
        self.live.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
pub trait ConnectionBackend: Send + Sync + 'static {
    type Connection: QueryTransport + 'static;

    async fn connect(&self, profile: &ConnectionProfile)
        -> Result<Self::Connection, TransportError>;

    /// Resolves when the transport closes on its own. The default never does.
    async fn monitor(&self, _connection: &Self::Connection) -> TransportError {
        std::future::pending::<TransportError>().await
    }

    async fn disconnect(&self, connection: Arc<Self::Connection>) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub handle: Option<ConnectionHandle>,
    pub endpoint: Option<String>,
    pub connected_at: Option<SystemTime>,
    pub last_latency: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("invalid connection profile: {0}")]
    Profile(#[from] ProfileError),
    #[error("connection manager is not connected")]
    NotConnected,
    #[error("connection backend failed: {0}")]
    Backend(#[source] TransportError),
}

enum TransportReport<C> {
    Opened {
        handle: HandleId,
        connection: Arc<C>,
        latency: Duration,
    },
    Failed {
        handle: HandleId,
        error: TransportError,
    },
}

pub struct ConnectionManager<B: ConnectionBackend> {
    backend: Arc<B>,
    machine: ConnectionMachine,
    live: Arc<AtomicU64>,
    next_handle: u64,
    connection: Option<Arc<B::Connection>>,
    endpoint: Option<String>,
    connected_at: Option<SystemTime>,
    last_latency: Option<Duration>,
    monitor: Option<JoinHandle<()>>,
    pending: VecDeque<ConnectionEvent>,
    reports_tx: mpsc::UnboundedSender<TransportReport<B::Connection>>,
    reports_rx: mpsc::UnboundedReceiver<TransportReport<B::Connection>>,
}

impl<B: ConnectionBackend> fmt::Debug for ConnectionManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("machine", &self.machine)
            .field("endpoint", &self.endpoint)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<B: ConnectionBackend> ConnectionManager<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            backend: Arc::new(backend),
            machine: ConnectionMachine::new(),
            live: Arc::new(AtomicU64::new(0)),
            next_handle: 0,
            connection: None,
            endpoint: None,
            connected_at: None,
            last_latency: None,
            monitor: None,
            pending: VecDeque::new(),
            reports_tx,
            reports_rx,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    #[must_use]
    pub fn current_handle(&self) -> Option<ConnectionHandle> {
        self.machine.current()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.machine.state(),
            handle: self.machine.current(),
            endpoint: self.endpoint.clone(),
            connected_at: self.connected_at,
            last_latency: self.last_latency,
        }
    }

    /// Whether results produced under `handle` may still be applied.
    #[must_use]
    pub fn is_current(&self, handle: ConnectionHandle) -> bool {
        self.live.load(Ordering::SeqCst) == handle.id.0
    }

    pub fn lease(&self) -> Result<ConnectionLease, ConnectionManagerError> {
        let (Some(handle), Some(connection)) = (self.machine.current(), &self.connection) else {
            return Err(ConnectionManagerError::NotConnected);
        };
        if self.machine.state() != ConnectionState::Connected {
            return Err(ConnectionManagerError::NotConnected);
        }

        let transport: Arc<dyn QueryTransport> = Arc::clone(connection) as Arc<dyn QueryTransport>;
        Ok(ConnectionLease {
            handle,
            transport,
            live: Arc::clone(&self.live),
        })
    }

    /// Starts connecting `session_id` with `profile`, closing whatever handle
    /// was live before.
    #[tracing::instrument(skip_all, fields(session_id = %session_id, endpoint = %profile.endpoint))]
    pub async fn open(
        &mut self,
        session_id: SessionId,
        profile: ConnectionProfile,
    ) -> Result<ConnectionHandle, ConnectionManagerError> {
        profile.validate()?;
        if let Err(error) = self.close().await {
            tracing::warn!(%error, "previous connection did not close cleanly");
        }

        self.next_handle += 1;
        let handle = ConnectionHandle {
            id: HandleId(self.next_handle),
            session_id,
        };
        let events = self.machine.apply(ConnectionInput::Open(handle));
        self.pending.extend(events);
        self.endpoint = Some(profile.endpoint.clone());
        tracing::info!(handle = %handle.id, "opening connection");

        let backend = Arc::clone(&self.backend);
        let reports_tx = self.reports_tx.clone();
        tokio::spawn(async move {
            let started_at = Instant::now();
            let report = match backend.connect(&profile).await {
                Ok(connection) => TransportReport::Opened {
                    handle: handle.id,
                    connection: Arc::new(connection),
                    latency: started_at.elapsed(),
                },
                Err(error) => TransportReport::Failed {
                    handle: handle.id,
                    error,
                },
            };
            let _ = reports_tx.send(report);
        });

        Ok(handle)
    }

    /// Closes the live handle, if any. The state is Disconnected afterwards
    /// even when the backend fails to shut the transport down cleanly.
    pub async fn close(&mut self) -> Result<(), ConnectionManagerError> {
        let events = self.machine.apply(ConnectionInput::Close);
        if events.is_empty() {
            return Ok(());
        }
        self.pending.extend(events);
        self.release();

        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        tracing::info!("closing connection");
        self.backend
            .disconnect(connection)
            .await
            .map_err(ConnectionManagerError::Backend)
    }

    /// Feeds a failure observed outside the manager, such as a query that
    /// found the transport gone.
    pub fn report_failure(&mut self, handle: ConnectionHandle, error: TransportError) {
        self.apply_report(TransportReport::Failed {
            handle: handle.id,
            error,
        });
    }

    /// Applies every transport report received so far.
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        while let Ok(report) = self.reports_rx.try_recv() {
            self.apply_report(report);
        }
        self.pending.drain(..).collect()
    }

    /// Waits until at least one event is available.
    pub async fn next_events(&mut self) -> Vec<ConnectionEvent> {
        loop {
            let events = self.drain_events();
            if !events.is_empty() {
                return events;
            }
            let Some(report) = self.reports_rx.recv().await else {
                return Vec::new();
            };
            self.apply_report(report);
        }
    }

    fn apply_report(&mut self, report: TransportReport<B::Connection>) {
        match report {
            TransportReport::Opened {
                handle,
                connection,
                latency,
            } => {
                let events = self
                    .machine
                    .apply(ConnectionInput::TransportOpened(handle));
                if events.is_empty() {
                    tracing::debug!(%handle, "discarding stale connection");
                    let backend = Arc::clone(&self.backend);
                    tokio::spawn(async move {
                        if let Err(error) = backend.disconnect(connection).await {
                            tracing::debug!(%error, "stale connection did not close cleanly");
                        }
                    });
                    return;
                }

                tracing::info!(%handle, latency_ms = latency.as_millis(), "connection established");
                self.live.store(handle.0, Ordering::SeqCst);
                self.connected_at = Some(SystemTime::now());
                self.last_latency = Some(latency);
                self.connection = Some(Arc::clone(&connection));
                self.spawn_monitor(handle, connection);
                self.pending.extend(events);
            }
            TransportReport::Failed { handle, error } => {
                let events = self
                    .machine
                    .apply(ConnectionInput::TransportFailed { handle, error });
                if events.is_empty() {
                    tracing::debug!(%handle, "ignoring failure for stale connection");
                    return;
                }
                tracing::info!(%handle, "connection lost");
                self.release();
                self.connection = None;
                self.pending.extend(events);
            }
        }
    }

    fn spawn_monitor(&mut self, handle: HandleId, connection: Arc<B::Connection>) {
        let backend = Arc::clone(&self.backend);
        let reports_tx = self.reports_tx.clone();
        self.monitor = Some(tokio::spawn(async move {
            let error = backend.monitor(&connection).await;
            let _ = reports_tx.send(TransportReport::Failed { handle, error });
        }));
    }

    fn release(&mut self) {
        self.live.store(0, Ordering::SeqCst);
        self.connected_at = None;
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

impl<B: ConnectionBackend> Drop for ConnectionManager<B> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}
