//! The single owner of UI-facing state.
//!
//! A [`Workbench`] turns user intents into calls on the session store,
//! connection manager, query executor and schema cache, and folds connection
//! events back into them. Transport work runs on tokio tasks; everything it
//! produces comes back through `&mut self`.

use std::sync::Arc;

use thiserror::Error;

use crate::connection_manager::{
    ConnectionBackend, ConnectionEvent, ConnectionEventKind, ConnectionHandle, ConnectionLease,
    ConnectionManager, ConnectionManagerError, ConnectionState, ConnectionStatus, TransportError,
};
use crate::favorites::{FavoriteQuery, FavoritesError, FileFavoritesStore};
use crate::notifications::{Notice, NotificationSink};
use crate::platform::WindowCapabilities;
use crate::profiles::ConnectionProfile;
use crate::query_executor::{parse_variables, QueryError, QueryExecutor, QueryOutcome};
use crate::query_history::{
    unix_timestamp_millis, FileQueryHistory, HistoryEntry, HistoryError, HistoryOutcome,
};
use crate::schema_cache::{
    SchemaCache, SchemaCacheError, SchemaSnapshot, TableDescriptor, TableMode,
};
use crate::session_store::{
    ListingMode, Session, SessionId, SessionPatch, SessionState, SessionStore, SessionStoreError,
    EMPTY_VARIABLES,
};
use crate::statements::{define_table_statement, StatementError, TableDefinition};

pub const CONNECTION_CLOSED_TITLE: &str = "Connection Closed";
pub const QUERY_FAILED_TITLE: &str = "Query Failed";
const UNKNOWN_REASON: &str = "Unknown reason";

#[derive(Debug, Error)]
pub enum WorkbenchError {
    #[error("no session is active")]
    NoActiveSession,
    #[error("session {0} does not exist")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    Connection(#[from] ConnectionManagerError),
    #[error(transparent)]
    Schema(#[from] SchemaCacheError),
    #[error(transparent)]
    Statement(#[from] StatementError),
    #[error("statement was rejected: {0}")]
    StatementRejected(String),
    #[error("statement transport failed: {0}")]
    Transport(#[source] TransportError),
    #[error(transparent)]
    Favorites(#[from] FavoritesError),
    #[error("favorites are not available")]
    FavoritesUnavailable,
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("query history is not available")]
    HistoryUnavailable,
}

/// What became of a query once its result came back.
#[derive(Debug)]
pub enum SendOutcome {
    /// The response replaced the session's last response.
    Applied(QueryOutcome),
    /// The connection changed while the query ran; the response was dropped.
    Discarded,
    /// The query never produced a response. A notice was already emitted.
    Rejected(QueryError),
}

/// A query bound to the connection that was live when it was issued. Owns
/// everything it needs so it can run on another task.
#[derive(Debug)]
pub struct QueryTicket {
    executor: QueryExecutor,
    lease: Option<ConnectionLease>,
    session_id: SessionId,
    endpoint: String,
    query: String,
    variables: String,
}

impl QueryTicket {
    pub async fn run(self) -> QueryCompletion {
        let result = self
            .executor
            .execute(
                self.lease.as_ref(),
                self.session_id,
                &self.query,
                &self.variables,
            )
            .await;
        QueryCompletion {
            session_id: self.session_id,
            handle: self.lease.as_ref().map(ConnectionLease::handle),
            endpoint: self.endpoint,
            query: self.query,
            result,
        }
    }
}

#[derive(Debug)]
pub struct QueryCompletion {
    session_id: SessionId,
    handle: Option<ConnectionHandle>,
    endpoint: String,
    query: String,
    result: Result<QueryOutcome, QueryError>,
}

pub struct Workbench<B: ConnectionBackend> {
    sessions: SessionStore,
    connections: ConnectionManager<B>,
    executor: QueryExecutor,
    schema: SchemaCache,
    notifier: Arc<dyn NotificationSink>,
    history: Option<FileQueryHistory>,
    favorites: Option<FileFavoritesStore>,
    variables_invalid: bool,
}

impl<B: ConnectionBackend> std::fmt::Debug for Workbench<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workbench")
            .field("sessions", &self.sessions)
            .field("connections", &self.connections)
            .field("variables_invalid", &self.variables_invalid)
            .finish_non_exhaustive()
    }
}

impl<B: ConnectionBackend> Workbench<B> {
    #[must_use]
    pub fn new(sessions: SessionStore, backend: B, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            sessions,
            connections: ConnectionManager::new(backend),
            executor: QueryExecutor::new(),
            schema: SchemaCache::new(),
            notifier,
            history: None,
            favorites: None,
            variables_invalid: false,
        }
    }

    #[must_use]
    pub fn with_history(mut self, history: FileQueryHistory) -> Self {
        self.history = Some(history);
        self
    }

    #[must_use]
    pub fn with_favorites(mut self, favorites: FileFavoritesStore) -> Self {
        self.favorites = Some(favorites);
        self
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        self.sessions.state()
    }

    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.sessions.active_session()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connections.status()
    }

    #[must_use]
    pub fn schema(&self) -> Arc<SchemaSnapshot> {
        self.schema.snapshot()
    }

    /// Whether the last variables text offered to [`Self::set_variables`]
    /// was rejected.
    #[must_use]
    pub fn variables_invalid(&self) -> bool {
        self.variables_invalid
    }

    #[must_use]
    pub fn window_capabilities(&self) -> WindowCapabilities {
        WindowCapabilities::of(self.sessions.window().as_ref())
    }

    #[must_use]
    pub fn favorites(&self) -> Vec<FavoriteQuery> {
        self.favorites
            .as_ref()
            .map(FileFavoritesStore::favorites)
            .unwrap_or_default()
    }

    pub fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, WorkbenchError> {
        let history = self
            .history
            .as_ref()
            .ok_or(WorkbenchError::HistoryUnavailable)?;
        Ok(history.recent(limit)?)
    }

    fn active_id(&self) -> Result<SessionId, WorkbenchError> {
        self.sessions
            .state()
            .active_session_id
            .ok_or(WorkbenchError::NoActiveSession)
    }

    /// Adds a tab with the default connection details and switches to it.
    pub async fn create_session(&mut self) -> Result<SessionId, WorkbenchError> {
        let id = self.sessions.add_session(ConnectionProfile::default())?;
        self.switch_session(id).await?;
        Ok(id)
    }

    pub async fn switch_session(&mut self, id: SessionId) -> Result<(), WorkbenchError> {
        if self.sessions.session(id).is_none() {
            return Err(WorkbenchError::UnknownSession(id));
        }
        if self.sessions.state().active_session_id == Some(id) {
            return Ok(());
        }

        self.disconnect().await?;
        self.sessions.set_active_session(id)?;
        self.variables_invalid = false;
        tracing::debug!(session_id = %id, "switched session");
        Ok(())
    }

    pub fn rename_session(&mut self, name: &str) -> Result<(), WorkbenchError> {
        let id = self.active_id()?;
        self.sessions
            .update_session(id, SessionPatch::name(name.trim()))?;
        Ok(())
    }

    pub async fn remove_session(&mut self, id: SessionId) -> Result<(), WorkbenchError> {
        if self.sessions.session(id).is_none() {
            return Err(WorkbenchError::UnknownSession(id));
        }
        if self.sessions.state().active_session_id == Some(id) {
            self.disconnect().await?;
        }
        self.sessions.remove_session(id)?;
        Ok(())
    }

    /// Stores new connection details for the active tab. A live connection
    /// was opened with the old details, so it is closed first.
    pub async fn save_connection_details(
        &mut self,
        profile: ConnectionProfile,
    ) -> Result<(), WorkbenchError> {
        let id = self.active_id()?;
        if self.connections.state() != ConnectionState::Disconnected {
            self.disconnect().await?;
        }
        self.sessions
            .update_session(id, SessionPatch::connection(profile))?;
        Ok(())
    }

    pub fn set_query(&mut self, query: &str) -> Result<(), WorkbenchError> {
        let id = self.active_id()?;
        self.sessions.update_session(id, SessionPatch::query(query))?;
        Ok(())
    }

    /// Stores `text` only when it parses as a JSON object. Blank text is
    /// stored as `{}`. Otherwise the stored variables are kept and the
    /// invalid flag is set.
    pub fn set_variables(&mut self, text: &str) -> Result<(), WorkbenchError> {
        let id = self.active_id()?;
        if let Err(error) = parse_variables(text) {
            tracing::debug!(%error, "ignoring invalid variables");
            self.variables_invalid = true;
            return Ok(());
        }
        self.variables_invalid = false;
        let text = if text.trim().is_empty() {
            EMPTY_VARIABLES
        } else {
            text
        };
        self.sessions
            .update_session(id, SessionPatch::variables(text))?;
        Ok(())
    }

    pub async fn connect(&mut self) -> Result<(), WorkbenchError> {
        let session = self
            .sessions
            .active_session()
            .ok_or(WorkbenchError::NoActiveSession)?;
        if self.connections.state() == ConnectionState::Connecting {
            tracing::debug!("connect ignored while a connection is opening");
            return Ok(());
        }

        let (id, profile) = (session.id, session.connection.clone());
        self.connections.open(id, profile).await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), WorkbenchError> {
        if let Err(error) = self.connections.close().await {
            tracing::warn!(%error, "connection did not close cleanly");
        }
        let events = self.connections.drain_events();
        self.handle_events(events).await;
        Ok(())
    }

    /// Waits for the next connection events without applying them. Pair with
    /// [`Self::handle_events`].
    pub async fn wait_events(&mut self) -> Vec<ConnectionEvent> {
        self.connections.next_events().await
    }

    /// Waits for connection events and applies them.
    pub async fn pump_events(&mut self) -> Vec<ConnectionEvent> {
        let events = self.connections.next_events().await;
        self.handle_events(events.clone()).await;
        events
    }

    /// Applies events that are already available, without waiting.
    pub async fn poll_events(&mut self) -> Vec<ConnectionEvent> {
        let events = self.connections.drain_events();
        self.handle_events(events.clone()).await;
        events
    }

    pub async fn handle_events(&mut self, events: Vec<ConnectionEvent>) {
        for event in events {
            match event.kind {
                ConnectionEventKind::Connected => {
                    tracing::info!(handle = %event.handle.id, "connected");
                    if let Err(error) = self.refresh_schema().await {
                        tracing::warn!(%error, "schema refresh after connect failed");
                    }
                }
                ConnectionEventKind::Error { code, message } => {
                    let reason = if message.is_empty() {
                        UNKNOWN_REASON
                    } else {
                        message.as_str()
                    };
                    self.notifier.notify(Notice::error(
                        CONNECTION_CLOSED_TITLE,
                        format!("{reason} ({code})"),
                    ));
                }
                ConnectionEventKind::Disconnected => {
                    tracing::info!(handle = %event.handle.id, "disconnected");
                    self.schema.invalidate();
                }
            }
        }
    }

    /// Binds `query` and `variables` to the active tab and the live
    /// connection.
    pub fn prepare_query(
        &self,
        query: &str,
        variables: &str,
    ) -> Result<QueryTicket, WorkbenchError> {
        let session = self
            .sessions
            .active_session()
            .ok_or(WorkbenchError::NoActiveSession)?;
        Ok(QueryTicket {
            executor: self.executor.clone(),
            lease: self.connections.lease().ok(),
            session_id: session.id,
            endpoint: session.connection.endpoint.clone(),
            query: query.to_string(),
            variables: variables.to_string(),
        })
    }

    /// Runs the active tab's stored query with its stored variables.
    pub async fn send_query(&mut self) -> Result<SendOutcome, WorkbenchError> {
        let session = self
            .sessions
            .active_session()
            .ok_or(WorkbenchError::NoActiveSession)?;
        let (query, variables) = (session.query.clone(), session.variables.clone());
        self.send_query_text(&query, &variables).await
    }

    pub async fn send_query_text(
        &mut self,
        query: &str,
        variables: &str,
    ) -> Result<SendOutcome, WorkbenchError> {
        let ticket = self.prepare_query(query, variables)?;
        let completion = ticket.run().await;
        self.complete_query(completion).await
    }

    /// Commits a finished query. The response is applied only if the
    /// connection it ran on is still the live one.
    pub async fn complete_query(
        &mut self,
        completion: QueryCompletion,
    ) -> Result<SendOutcome, WorkbenchError> {
        let QueryCompletion {
            session_id,
            handle,
            endpoint,
            query,
            result,
        } = completion;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                self.reject_query(session_id, handle, &endpoint, &query, &error)
                    .await;
                return Ok(SendOutcome::Rejected(error));
            }
        };

        if !self.connections.is_current(outcome.handle) {
            tracing::info!(session_id = %session_id, "discarding result from a closed connection");
            self.record_history(
                session_id,
                &endpoint,
                &query,
                HistoryOutcome::Discarded,
                Some(&outcome),
                None,
            );
            return Ok(SendOutcome::Discarded);
        }

        self.sessions.update_session(
            session_id,
            SessionPatch::last_response(outcome.records.clone()),
        )?;
        let first_error = outcome
            .records
            .iter()
            .find_map(|record| record.error_message().map(str::to_string));
        let history_outcome = if first_error.is_some() {
            HistoryOutcome::Failed
        } else {
            HistoryOutcome::Succeeded
        };
        self.record_history(
            session_id,
            &endpoint,
            &query,
            history_outcome,
            Some(&outcome),
            first_error,
        );
        Ok(SendOutcome::Applied(outcome))
    }

    async fn reject_query(
        &mut self,
        session_id: SessionId,
        handle: Option<ConnectionHandle>,
        endpoint: &str,
        query: &str,
        error: &QueryError,
    ) {
        match error {
            QueryError::Transport(transport) => {
                self.record_history(
                    session_id,
                    endpoint,
                    query,
                    HistoryOutcome::Failed,
                    None,
                    Some(transport.to_string()),
                );
                match handle {
                    Some(handle) if transport.is_connection_lost() => {
                        self.connections.report_failure(handle, transport.clone());
                        let events = self.connections.drain_events();
                        self.handle_events(events).await;
                    }
                    _ => self
                        .notifier
                        .notify(Notice::error(QUERY_FAILED_TITLE, error.to_string())),
                }
            }
            QueryError::NotConnected | QueryError::InvalidVariables(_) | QueryError::Busy(_) => {
                self.notifier
                    .notify(Notice::error(QUERY_FAILED_TITLE, error.to_string()));
            }
        }
    }

    fn record_history(
        &self,
        session_id: SessionId,
        endpoint: &str,
        query: &str,
        outcome: HistoryOutcome,
        result: Option<&QueryOutcome>,
        error: Option<String>,
    ) {
        let Some(history) = &self.history else {
            return;
        };
        let entry = HistoryEntry {
            timestamp_unix_ms: unix_timestamp_millis(),
            session_id,
            endpoint: endpoint.to_string(),
            query: query.to_string(),
            outcome,
            elapsed_ms: result.map(|result| result.elapsed.as_millis()),
            error,
        };
        if let Err(error) = history.append(&entry) {
            tracing::warn!(%error, "failed to record query history");
        }
    }

    pub async fn refresh_schema(&mut self) -> Result<Arc<SchemaSnapshot>, WorkbenchError> {
        let lease = self.connections.lease().ok();
        Ok(self.schema.refresh(lease.as_ref()).await?)
    }

    #[must_use]
    pub fn tables(&self, mode: TableMode) -> Vec<TableDescriptor> {
        self.schema.tables(mode)
    }

    /// Defines a table on the live connection and reloads the schema.
    pub async fn create_table(
        &mut self,
        definition: &TableDefinition,
    ) -> Result<Arc<SchemaSnapshot>, WorkbenchError> {
        let statement = define_table_statement(definition)?;
        let lease = self.connections.lease()?;
        let records = lease
            .transport()
            .query(&statement, None)
            .await
            .map_err(WorkbenchError::Transport)?;
        if let Some(message) = records.iter().find_map(|record| record.error_message()) {
            return Err(WorkbenchError::StatementRejected(message.to_string()));
        }
        tracing::info!(table = %definition.name, "table defined");
        self.refresh_schema().await
    }

    pub fn toggle_pinned(&mut self) -> Result<bool, WorkbenchError> {
        self.sessions.toggle_pinned()?;
        Ok(self.sessions.state().pinned)
    }

    /// Shows the history listing, or hides it when it is already showing.
    /// Returns whether the listing is visible afterwards.
    pub fn toggle_history(&mut self) -> Result<bool, WorkbenchError> {
        self.toggle_listing(ListingMode::History)
    }

    pub fn toggle_favorites(&mut self) -> Result<bool, WorkbenchError> {
        self.toggle_listing(ListingMode::Favorites)
    }

    fn toggle_listing(&mut self, mode: ListingMode) -> Result<bool, WorkbenchError> {
        let listing = self.sessions.state().listing;
        if listing.enabled && listing.mode == mode {
            self.sessions.set_listing_enabled(false)?;
            return Ok(false);
        }
        self.sessions.set_listing_mode(mode)?;
        self.sessions.set_listing_enabled(true)?;
        Ok(true)
    }

    /// Saves the active tab's query under `name`, replacing any favorite
    /// with the same name.
    pub fn save_favorite(&mut self, name: &str) -> Result<(), WorkbenchError> {
        let query = self
            .sessions
            .active_session()
            .ok_or(WorkbenchError::NoActiveSession)?
            .query
            .clone();
        let favorites = self
            .favorites
            .as_mut()
            .ok_or(WorkbenchError::FavoritesUnavailable)?;
        favorites.upsert(name, &query)?;
        favorites.persist()?;
        Ok(())
    }

    pub fn remove_favorite(&mut self, name: &str) -> Result<bool, WorkbenchError> {
        let favorites = self
            .favorites
            .as_mut()
            .ok_or(WorkbenchError::FavoritesUnavailable)?;
        let removed = favorites.remove(name);
        if removed {
            favorites.persist()?;
        }
        Ok(removed)
    }

    /// Copies a favorite's query into the active tab.
    pub fn load_favorite(&mut self, name: &str) -> Result<bool, WorkbenchError> {
        let Some(query) = self
            .favorites
            .as_ref()
            .and_then(|favorites| favorites.query(name))
            .map(str::to_string)
        else {
            return Ok(false);
        };
        self.set_query(&query)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::{SendOutcome, Workbench, WorkbenchError, CONNECTION_CLOSED_TITLE};
    use crate::config_store::MemoryConfigStore;
    use crate::connection_manager::{
        ConnectionBackend, ConnectionEventKind, ConnectionState, TransportError,
    };
    use crate::favorites::FileFavoritesStore;
    use crate::notifications::{Notice, NotificationSink};
    use crate::platform::HeadlessWindow;
    use crate::profiles::ConnectionProfile;
    use crate::query_executor::{QueryError, QueryTransport, StatementResult, Variables};
    use crate::query_history::{FileQueryHistory, HistoryOutcome};
    use crate::schema_cache::{TableKind, TableMode};
    use crate::session_store::{ListingMode, SessionStore};
    use crate::statements::{TableDefinition, INFO_FOR_DB};

    #[derive(Debug, Default)]
    struct Control {
        drop_signal: Notify,
        drop_error: Mutex<Option<TransportError>>,
        query_error: Mutex<Option<TransportError>>,
        responses: Mutex<VecDeque<Vec<StatementResult>>>,
        statements: Mutex<Vec<String>>,
    }

    impl Control {
        fn drop_connection(&self, error: TransportError) {
            *self.drop_error.lock() = Some(error);
            self.drop_signal.notify_one();
        }
    }

    #[derive(Debug)]
    struct ScriptedBackend {
        control: Arc<Control>,
    }

    #[derive(Debug)]
    struct ScriptedConnection {
        control: Arc<Control>,
    }

    #[async_trait::async_trait]
    impl QueryTransport for ScriptedConnection {
        async fn query(
            &self,
            statement: &str,
            _variables: Option<&Variables>,
        ) -> Result<Vec<StatementResult>, TransportError> {
            self.control.statements.lock().push(statement.to_string());
            if let Some(error) = self.control.query_error.lock().take() {
                return Err(error);
            }
            if statement == INFO_FOR_DB {
                return Ok(vec![StatementResult::ok(json!({
                    "tb": {
                        "user": "DEFINE TABLE user SCHEMAFULL",
                        "likes": "DEFINE TABLE likes TYPE RELATION SCHEMALESS",
                    }
                }))]);
            }
            if statement.starts_with("DEFINE") {
                return Ok(vec![StatementResult::ok(json!(null))]);
            }
            if let Some(records) = self.control.responses.lock().pop_front() {
                return Ok(records);
            }
            Ok(vec![StatementResult::ok(json!([
                { "id": "user:tobie", "name": "Tobie" }
            ]))])
        }
    }

    #[async_trait::async_trait]
    impl ConnectionBackend for ScriptedBackend {
        type Connection = ScriptedConnection;

        async fn connect(
            &self,
            _profile: &ConnectionProfile,
        ) -> Result<Self::Connection, TransportError> {
            Ok(ScriptedConnection {
                control: Arc::clone(&self.control),
            })
        }

        async fn monitor(&self, _connection: &Self::Connection) -> TransportError {
            self.control.drop_signal.notified().await;
            self.control
                .drop_error
                .lock()
                .take()
                .unwrap_or_else(|| TransportError::abnormal("dropped"))
        }

        async fn disconnect(
            &self,
            _connection: Arc<Self::Connection>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<Notice>>,
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(&self, notice: Notice) {
            self.notices.lock().push(notice);
        }
    }

    struct Harness {
        workbench: Workbench<ScriptedBackend>,
        control: Arc<Control>,
        notifier: Arc<RecordingNotifier>,
        config: Arc<MemoryConfigStore>,
    }

    async fn harness() -> Harness {
        let config = Arc::new(MemoryConfigStore::new());
        let store = SessionStore::load(Box::new(Arc::clone(&config)), Arc::new(HeadlessWindow))
            .expect("memory store should load");
        let control = Arc::new(Control::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut workbench = Workbench::new(
            store,
            ScriptedBackend {
                control: Arc::clone(&control),
            },
            notifier.clone(),
        );
        workbench
            .create_session()
            .await
            .expect("create session should succeed");
        Harness {
            workbench,
            control,
            notifier,
            config,
        }
    }

    async fn connected_harness() -> Harness {
        let mut harness = harness().await;
        harness
            .workbench
            .connect()
            .await
            .expect("connect should succeed");
        let events = harness.workbench.pump_events().await;
        assert_eq!(events[0].kind, ConnectionEventKind::Connected);
        harness
    }

    #[tokio::test]
    async fn connect_execute_and_reject_malformed_variables() {
        let mut harness = connected_harness().await;
        let workbench = &mut harness.workbench;
        assert_eq!(
            workbench
                .active_session()
                .map(|session| session.connection.endpoint.as_str()),
            Some("http://localhost:8000/")
        );

        let outcome = workbench
            .send_query_text("SELECT * FROM user", "{}")
            .await
            .expect("send should succeed");
        assert!(matches!(outcome, SendOutcome::Applied(_)));
        let stored = workbench
            .active_session()
            .map(|session| session.last_response.clone())
            .expect("active session");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].result[0]["name"], "Tobie");

        let outcome = workbench
            .send_query_text("SELECT * FROM user", "{")
            .await
            .expect("send should return an outcome");
        assert!(matches!(
            outcome,
            SendOutcome::Rejected(QueryError::InvalidVariables(_))
        ));
        assert_eq!(
            workbench
                .active_session()
                .map(|session| session.last_response.clone()),
            Some(stored)
        );
    }

    #[tokio::test]
    async fn connected_event_loads_schema() {
        let harness = connected_harness().await;
        let workbench = &harness.workbench;

        let names = workbench
            .tables(TableMode::All)
            .into_iter()
            .map(|table| table.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["user", "likes"]);
        assert_eq!(workbench.tables(TableMode::Edge)[0].kind, TableKind::Edge);
    }

    #[tokio::test]
    async fn client_closed_code_produces_no_notice() {
        let mut harness = connected_harness().await;
        harness
            .control
            .drop_connection(TransportError::new(1005, "closed"));

        let events = harness.workbench.pump_events().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ConnectionEventKind::Disconnected);
        assert!(harness.notifier.notices.lock().is_empty());
        assert!(harness.workbench.tables(TableMode::All).is_empty());
    }

    #[tokio::test]
    async fn abnormal_closure_is_reported_with_code() {
        let mut harness = connected_harness().await;
        harness
            .control
            .drop_connection(TransportError::abnormal("abnormal closure"));

        harness.workbench.pump_events().await;

        let notices = harness.notifier.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].title.as_deref(), Some(CONNECTION_CLOSED_TITLE));
        assert!(notices[0].message.contains("abnormal closure (1006)"));
        assert_eq!(
            harness.workbench.connection_state(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn empty_close_reason_is_reported_as_unknown() {
        let mut harness = connected_harness().await;
        harness
            .control
            .drop_connection(TransportError::new(1011, ""));

        harness.workbench.pump_events().await;

        let notices = harness.notifier.notices.lock();
        assert_eq!(notices[0].message, "Unknown reason (1011)");
    }

    #[tokio::test]
    async fn sending_offline_notifies_without_mutating() {
        let mut harness = harness().await;
        let saves_before = harness.config.save_count();

        let outcome = harness
            .workbench
            .send_query_text("SELECT 1", "{}")
            .await
            .expect("send should return an outcome");

        assert!(matches!(
            outcome,
            SendOutcome::Rejected(QueryError::NotConnected)
        ));
        assert_eq!(harness.config.save_count(), saves_before);
        let notices = harness.notifier.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message, "You must be connected to send a query");
    }

    #[tokio::test]
    async fn result_arriving_after_close_is_discarded() {
        let mut harness = connected_harness().await;
        let workbench = &mut harness.workbench;

        let ticket = workbench
            .prepare_query("SELECT * FROM user", "")
            .expect("ticket should be issued");
        let completion = ticket.run().await;
        workbench
            .disconnect()
            .await
            .expect("disconnect should succeed");

        let outcome = workbench
            .complete_query(completion)
            .await
            .expect("completion should be handled");
        assert!(matches!(outcome, SendOutcome::Discarded));
        assert!(workbench
            .active_session()
            .is_some_and(|session| session.last_response.is_empty()));
    }

    #[tokio::test]
    async fn successful_query_replaces_previous_response() {
        let mut harness = connected_harness().await;
        harness.control.responses.lock().extend([
            vec![
                StatementResult::ok(json!([{ "id": "user:a" }])),
                StatementResult::ok(json!([{ "id": "user:b" }])),
            ],
            vec![StatementResult::ok(json!(42))],
        ]);

        for query in ["SELECT * FROM user; SELECT * FROM user", "RETURN 42"] {
            let outcome = harness
                .workbench
                .send_query_text(query, "")
                .await
                .expect("send should succeed");
            assert!(matches!(outcome, SendOutcome::Applied(_)));
        }

        let stored = harness
            .workbench
            .active_session()
            .map(|session| session.last_response.clone())
            .expect("active session");
        assert_eq!(stored, vec![StatementResult::ok(json!(42))]);
    }

    #[tokio::test]
    async fn lost_transport_during_query_closes_connection() {
        let mut harness = connected_harness().await;
        harness
            .workbench
            .send_query_text("SELECT * FROM user", "")
            .await
            .expect("send should succeed");
        let stored = harness
            .workbench
            .active_session()
            .map(|session| session.last_response.clone())
            .expect("active session");
        *harness.control.query_error.lock() = Some(TransportError::abnormal("connection reset"));

        let outcome = harness
            .workbench
            .send_query_text("SELECT 1", "")
            .await
            .expect("send should return an outcome");

        assert!(matches!(
            outcome,
            SendOutcome::Rejected(QueryError::Transport(_))
        ));
        assert_eq!(
            harness.workbench.connection_state(),
            ConnectionState::Disconnected
        );
        assert_eq!(
            harness
                .workbench
                .active_session()
                .map(|session| session.last_response.clone()),
            Some(stored)
        );
        let notices = harness.notifier.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message, "connection reset (1006)");
    }

    #[tokio::test]
    async fn connect_is_ignored_while_connecting() {
        let mut harness = harness().await;
        harness
            .workbench
            .connect()
            .await
            .expect("connect should succeed");
        let first = harness.workbench.connection_status().handle;

        harness
            .workbench
            .connect()
            .await
            .expect("second connect should be ignored");

        assert_eq!(harness.workbench.connection_status().handle, first);
        assert_eq!(
            harness.workbench.connection_state(),
            ConnectionState::Connecting
        );
    }

    #[tokio::test]
    async fn switching_session_closes_connection() {
        let mut harness = connected_harness().await;
        let first = harness
            .workbench
            .active_session()
            .map(|session| session.id)
            .expect("active session");

        let second = harness
            .workbench
            .create_session()
            .await
            .expect("create should succeed");

        assert_ne!(first, second);
        assert_eq!(harness.workbench.state().active_session_id, Some(second));
        assert_eq!(
            harness.workbench.connection_state(),
            ConnectionState::Disconnected
        );
        assert!(harness.workbench.tables(TableMode::All).is_empty());
    }

    #[tokio::test]
    async fn saving_connection_details_while_online_disconnects() {
        let mut harness = connected_harness().await;

        harness
            .workbench
            .save_connection_details(
                ConnectionProfile::new("http://db.internal:8000/", "root", "secret")
                    .with_namespace("test"),
            )
            .await
            .expect("save should succeed");

        assert_eq!(
            harness.workbench.connection_state(),
            ConnectionState::Disconnected
        );
        let profile = harness
            .workbench
            .active_session()
            .map(|session| session.connection.clone())
            .expect("active session");
        assert_eq!(profile.endpoint, "http://db.internal:8000/");
        assert_eq!(profile.namespace.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn new_tab_gets_default_connection_details() {
        let mut harness = harness().await;
        harness
            .workbench
            .save_connection_details(
                ConnectionProfile::new("http://db.internal:9000/", "admin", "s3cret")
                    .with_database("app"),
            )
            .await
            .expect("save should succeed");

        harness
            .workbench
            .create_session()
            .await
            .expect("create should succeed");

        let profile = harness
            .workbench
            .active_session()
            .map(|session| session.connection.clone())
            .expect("active session");
        assert_eq!(profile, ConnectionProfile::default());
        assert_eq!(profile.password, "root");
    }

    #[tokio::test]
    async fn invalid_variables_are_flagged_and_not_stored() {
        let mut harness = harness().await;
        let workbench = &mut harness.workbench;

        workbench
            .set_variables("{\"id\": 1}")
            .expect("valid variables");
        workbench.set_variables("[1,2]").expect("flagged, not failed");

        assert!(workbench.variables_invalid());
        assert_eq!(
            workbench
                .active_session()
                .map(|session| session.variables.as_str()),
            Some("{\"id\": 1}")
        );

        workbench.set_variables("  ").expect("blank is valid");
        assert!(!workbench.variables_invalid());
        assert_eq!(
            workbench
                .active_session()
                .map(|session| session.variables.as_str()),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn create_table_sends_definition_and_reloads_schema() {
        let mut harness = connected_harness().await;

        harness
            .workbench
            .create_table(&TableDefinition::relation(
                "likes",
                vec!["user".to_string()],
                vec!["post".to_string()],
            ))
            .await
            .expect("create should succeed");

        let statements = harness.control.statements.lock().clone();
        assert!(statements
            .iter()
            .any(|statement| statement.starts_with("DEFINE TABLE likes TYPE RELATION")));
        assert_eq!(statements.last().map(String::as_str), Some(INFO_FOR_DB));
    }

    #[tokio::test]
    async fn create_table_offline_is_not_connected() {
        let mut harness = harness().await;
        let err = harness
            .workbench
            .create_table(&TableDefinition::table("user"))
            .await
            .expect_err("offline create should fail");
        assert!(matches!(err, WorkbenchError::Connection(_)));
    }

    #[tokio::test]
    async fn listing_toggles_switch_mode_then_hide() {
        let mut harness = harness().await;
        let workbench = &mut harness.workbench;

        assert!(workbench.toggle_history().expect("toggle should succeed"));
        assert_eq!(workbench.state().listing.mode, ListingMode::History);

        assert!(workbench.toggle_favorites().expect("toggle should succeed"));
        assert_eq!(workbench.state().listing.mode, ListingMode::Favorites);
        assert!(workbench.state().listing.enabled);

        assert!(!workbench.toggle_favorites().expect("toggle should succeed"));
        assert!(!workbench.state().listing.enabled);
    }

    #[tokio::test]
    async fn favorites_and_history_are_recorded() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let harness = connected_harness().await;
        let mut workbench = harness
            .workbench
            .with_history(FileQueryHistory::from_path(
                temp_dir.path().join("history.ndjson"),
            ))
            .with_favorites(
                FileFavoritesStore::load_from_path(temp_dir.path().join("favorites.toml"))
                    .expect("favorites should load"),
            );

        workbench
            .set_query("SELECT * FROM user")
            .expect("set query should succeed");
        workbench.send_query().await.expect("send should succeed");
        workbench
            .save_favorite("users")
            .expect("save favorite should succeed");

        assert_eq!(workbench.favorites().len(), 1);
        let history = workbench.recent_history(5).expect("history should read");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, HistoryOutcome::Succeeded);
        assert_eq!(history[0].query, "SELECT * FROM user");

        workbench.set_query("").expect("set query should succeed");
        assert!(workbench.load_favorite("users").expect("load should succeed"));
        assert_eq!(
            workbench
                .active_session()
                .map(|session| session.query.as_str()),
            Some("SELECT * FROM user")
        );
        assert!(workbench
            .remove_favorite("users")
            .expect("remove should succeed"));
    }

    #[tokio::test]
    async fn session_operations_need_an_active_session() {
        let config = Arc::new(MemoryConfigStore::new());
        let store = SessionStore::load(Box::new(config), Arc::new(HeadlessWindow))
            .expect("memory store should load");
        let mut workbench = Workbench::new(
            store,
            ScriptedBackend {
                control: Arc::new(Control::default()),
            },
            Arc::new(RecordingNotifier::default()),
        );

        assert!(matches!(
            workbench.set_query("SELECT 1"),
            Err(WorkbenchError::NoActiveSession)
        ));
        assert!(matches!(
            workbench.connect().await,
            Err(WorkbenchError::NoActiveSession)
        ));
        assert!(matches!(
            workbench.send_query().await,
            Err(WorkbenchError::NoActiveSession)
        ));
    }
}
