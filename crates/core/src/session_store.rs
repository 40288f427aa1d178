//! Tabs, the active tab, and the per-tab query state.
//!
//! Every mutation goes through [`reduce`], a pure function from the current
//! state and an action to the next state plus the side effects that must
//! follow. [`SessionStore`] owns the state and runs those effects.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config_store::{ConfigStore, ConfigStoreError, PersistedConfig};
use crate::platform::{window_title, WindowAdapter};
use crate::profiles::ConnectionProfile;
use crate::query_executor::StatementResult;

pub const EMPTY_VARIABLES: &str = "{}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw).map(Self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    #[serde(default)]
    pub query: String,
    #[serde(default = "empty_variables")]
    pub variables: String,
    #[serde(default)]
    pub last_response: Vec<StatementResult>,
    pub connection: ConnectionProfile,
}

fn empty_variables() -> String {
    EMPTY_VARIABLES.to_string()
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, name: impl Into<String>, connection: ConnectionProfile) -> Self {
        Self {
            id,
            name: name.into(),
            query: String::new(),
            variables: empty_variables(),
            last_response: Vec::new(),
            connection,
        }
    }
}

/// Fields to overwrite on an existing session. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub query: Option<String>,
    pub variables: Option<String>,
    pub last_response: Option<Vec<StatementResult>>,
    pub connection: Option<ConnectionProfile>,
}

impl SessionPatch {
    #[must_use]
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn variables(variables: impl Into<String>) -> Self {
        Self {
            variables: Some(variables.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn last_response(records: Vec<StatementResult>) -> Self {
        Self {
            last_response: Some(records),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn connection(profile: ConnectionProfile) -> Self {
        Self {
            connection: Some(profile),
            ..Self::default()
        }
    }

    fn apply(self, session: &mut Session) {
        if let Some(name) = self.name {
            session.name = name;
        }
        if let Some(query) = self.query {
            session.query = query;
        }
        if let Some(variables) = self.variables {
            session.variables = variables;
        }
        if let Some(last_response) = self.last_response {
            session.last_response = last_response;
        }
        if let Some(connection) = self.connection {
            session.connection = connection.normalized();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListingMode {
    #[default]
    History,
    Favorites,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ListingMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionState {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub active_session_id: Option<SessionId>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub listing: ListingConfig,
}

impl SessionState {
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == id)
    }

    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.active_session_id.and_then(|id| self.session(id))
    }

    fn position(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|session| session.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Add(Session),
    SetActive(SessionId),
    Update { id: SessionId, patch: SessionPatch },
    Remove(SessionId),
    TogglePinned,
    SetListingMode(ListingMode),
    SetListingEnabled(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Persist,
    RefreshTitle,
    TogglePinnedWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: &SessionState) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
        }
    }
}

#[must_use]
pub fn reduce(state: &SessionState, action: SessionAction) -> Transition {
    let mut next = state.clone();
    let effects = match action {
        SessionAction::Add(session) => {
            if next.position(session.id).is_some() {
                return Transition::unchanged(state);
            }
            next.sessions.push(session);
            vec![Effect::Persist, Effect::RefreshTitle]
        }
        SessionAction::SetActive(id) => {
            if next.position(id).is_none() || next.active_session_id == Some(id) {
                return Transition::unchanged(state);
            }
            next.active_session_id = Some(id);
            vec![Effect::Persist, Effect::RefreshTitle]
        }
        SessionAction::Update { id, patch } => {
            let Some(index) = next.position(id) else {
                return Transition::unchanged(state);
            };
            let renames = patch.name.is_some();
            patch.apply(&mut next.sessions[index]);
            if renames {
                vec![Effect::Persist, Effect::RefreshTitle]
            } else {
                vec![Effect::Persist]
            }
        }
        SessionAction::Remove(id) => {
            let Some(index) = next.position(id) else {
                return Transition::unchanged(state);
            };
            next.sessions.remove(index);
            if next.active_session_id == Some(id) {
                next.active_session_id = None;
            }
            vec![Effect::Persist, Effect::RefreshTitle]
        }
        SessionAction::TogglePinned => {
            next.pinned = !next.pinned;
            vec![
                Effect::TogglePinnedWindow,
                Effect::Persist,
                Effect::RefreshTitle,
            ]
        }
        SessionAction::SetListingMode(mode) => {
            if next.listing.mode == mode {
                return Transition::unchanged(state);
            }
            next.listing.mode = mode;
            vec![Effect::Persist]
        }
        SessionAction::SetListingEnabled(enabled) => {
            if next.listing.enabled == enabled {
                return Transition::unchanged(state);
            }
            next.listing.enabled = enabled;
            vec![Effect::Persist]
        }
    };

    Transition {
        state: next,
        effects,
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("failed to load session config: {0}")]
    Load(#[source] ConfigStoreError),
    #[error("failed to persist session config: {0}")]
    Persist(#[source] ConfigStoreError),
}

pub struct SessionStore {
    state: SessionState,
    config: Box<dyn ConfigStore>,
    window: Arc<dyn WindowAdapter>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn load(
        config: Box<dyn ConfigStore>,
        window: Arc<dyn WindowAdapter>,
    ) -> Result<Self, SessionStoreError> {
        let persisted = config.load().map_err(SessionStoreError::Load)?;
        tracing::info!(
            sessions = persisted.state.sessions.len(),
            "session store initialized"
        );
        let store = Self {
            state: persisted.state,
            config,
            window,
        };
        store.window.set_title(&window_title(&store.state));
        Ok(store)
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.state.session(id)
    }

    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.state.active_session()
    }

    #[must_use]
    pub fn window(&self) -> &Arc<dyn WindowAdapter> {
        &self.window
    }

    /// Appends a new tab named after its position and returns its id.
    pub fn add_session(
        &mut self,
        profile_defaults: ConnectionProfile,
    ) -> Result<SessionId, SessionStoreError> {
        let id = SessionId::new();
        let name = format!("Tab {}", self.state.sessions.len() + 1);
        self.dispatch(SessionAction::Add(Session::new(id, name, profile_defaults)))?;
        Ok(id)
    }

    pub fn set_active_session(&mut self, id: SessionId) -> Result<(), SessionStoreError> {
        self.dispatch(SessionAction::SetActive(id)).map(|_| ())
    }

    pub fn update_session(
        &mut self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<(), SessionStoreError> {
        self.dispatch(SessionAction::Update { id, patch }).map(|_| ())
    }

    pub fn remove_session(&mut self, id: SessionId) -> Result<(), SessionStoreError> {
        self.dispatch(SessionAction::Remove(id)).map(|_| ())
    }

    pub fn toggle_pinned(&mut self) -> Result<(), SessionStoreError> {
        self.dispatch(SessionAction::TogglePinned).map(|_| ())
    }

    pub fn set_listing_mode(&mut self, mode: ListingMode) -> Result<(), SessionStoreError> {
        self.dispatch(SessionAction::SetListingMode(mode)).map(|_| ())
    }

    pub fn set_listing_enabled(&mut self, enabled: bool) -> Result<(), SessionStoreError> {
        self.dispatch(SessionAction::SetListingEnabled(enabled)).map(|_| ())
    }

    /// Applies `action` and runs its effects. Returns whether anything changed.
    ///
    /// A failed save leaves the in-memory state updated; the next successful
    /// save writes it out.
    pub fn dispatch(&mut self, action: SessionAction) -> Result<bool, SessionStoreError> {
        let Transition { state, effects } = reduce(&self.state, action);
        if effects.is_empty() {
            tracing::debug!("session action had no effect");
            return Ok(false);
        }
        self.state = state;

        let mut persist_result = Ok(());
        for effect in effects {
            match effect {
                Effect::Persist => persist_result = self.persist(),
                Effect::RefreshTitle => self.window.set_title(&window_title(&self.state)),
                Effect::TogglePinnedWindow => {
                    if self.window.is_pinning_supported() {
                        self.window.toggle_pinned();
                    }
                }
            }
        }
        persist_result.map(|()| true)
    }

    fn persist(&self) -> Result<(), SessionStoreError> {
        let snapshot = PersistedConfig::new(self.state.clone());
        self.config.save(&snapshot).map_err(|error| {
            tracing::warn!(%error, "failed to persist session config");
            SessionStoreError::Persist(error)
        })
    }
}
