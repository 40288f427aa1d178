use std::collections::HashSet;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query_executor::parse_variables;
use crate::session_store::{SessionState, EMPTY_VARIABLES};

const CONFIG_VERSION: u32 = 1;
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk shape of the session model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedConfig {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(flatten)]
    pub state: SessionState,
}

fn current_version() -> u32 {
    CONFIG_VERSION
}

impl PersistedConfig {
    #[must_use]
    pub fn new(state: SessionState) -> Self {
        Self {
            version: CONFIG_VERSION,
            state,
        }
    }

    /// Repairs anything a hand-edited or older file may carry that the
    /// session model does not allow.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let mut seen = HashSet::new();
        self.state.sessions.retain(|session| {
            let fresh = seen.insert(session.id);
            if !fresh {
                tracing::warn!(session_id = %session.id, "dropping duplicate session from config");
            }
            fresh
        });

        for session in &mut self.state.sessions {
            if parse_variables(&session.variables).is_err() {
                tracing::warn!(session_id = %session.id, "resetting invalid session variables");
                session.variables = EMPTY_VARIABLES.to_string();
            }
            session.connection = std::mem::take(&mut session.connection).normalized();
        }

        if let Some(active) = self.state.active_session_id {
            if !self.state.sessions.iter().any(|session| session.id == active) {
                tracing::warn!(session_id = %active, "clearing dangling active session");
                self.state.active_session_id = None;
            }
        }

        self.version = CONFIG_VERSION;
        self
    }
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self::new(SessionState::default())
    }
}

pub trait ConfigStore: Send {
    fn load(&self) -> Result<PersistedConfig, ConfigStoreError>;
    fn save(&self, config: &PersistedConfig) -> Result<(), ConfigStoreError>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn load_default() -> Result<Self, ConfigStoreError> {
        Ok(Self::from_path(config_file_path(CONFIG_FILE)?))
    }

    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<PersistedConfig, ConfigStoreError> {
        let Some(raw) = read_config_file(&self.path)? else {
            return Ok(PersistedConfig::default());
        };

        let config: PersistedConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigStoreError::Parse {
                path: self.path.clone(),
                source,
            })?;

        tracing::debug!(
            path = %self.path.display(),
            sessions = config.state.sessions.len(),
            "loaded session config"
        );
        Ok(config.validated())
    }

    fn save(&self, config: &PersistedConfig) -> Result<(), ConfigStoreError> {
        let rendered = serde_json::to_string_pretty(config)
            .map_err(|source| ConfigStoreError::Serialize { source })?;
        write_config_file(&self.path, &rendered)
    }
}

/// Keeps the config in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<Option<PersistedConfig>>,
    saves: Mutex<usize>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: PersistedConfig) -> Self {
        Self {
            config: Mutex::new(Some(config)),
            saves: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<PersistedConfig> {
        self.config.lock().clone()
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<PersistedConfig, ConfigStoreError> {
        Ok(self.config.lock().clone().unwrap_or_default().validated())
    }

    fn save(&self, config: &PersistedConfig) -> Result<(), ConfigStoreError> {
        *self.config.lock() = Some(config.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

impl<T: ConfigStore + Sync> ConfigStore for std::sync::Arc<T> {
    fn load(&self) -> Result<PersistedConfig, ConfigStoreError> {
        (**self).load()
    }

    fn save(&self, config: &PersistedConfig) -> Result<(), ConfigStoreError> {
        (**self).save(config)
    }
}

pub fn default_config_dir() -> Result<PathBuf, ConfigStoreError> {
    if let Some(custom) = env::var_os("STRATA_CONFIG_DIR") {
        return Ok(PathBuf::from(custom));
    }

    let base_dir = if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ConfigStoreError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ConfigStoreError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("strata"))
}

pub fn config_file_path(file_name: &str) -> Result<PathBuf, ConfigStoreError> {
    Ok(default_config_dir()?.join(file_name))
}

/// Contents of a file kept in the config directory. A missing or blank file
/// reads as `None`.
pub fn read_config_file(path: &Path) -> Result<Option<String>, ConfigStoreError> {
    match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(raw)),
        Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigStoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Replaces `path` with `contents`, creating the parent directory first.
pub fn write_config_file(path: &Path, contents: &str) -> Result<(), ConfigStoreError> {
    if let Some(parent_dir) = path.parent() {
        fs::create_dir_all(parent_dir).map_err(|source| ConfigStoreError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, contents).map_err(|source| ConfigStoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::{
        read_config_file, write_config_file, ConfigStore, FileConfigStore, MemoryConfigStore,
        PersistedConfig,
    };
    use crate::profiles::ConnectionProfile;
    use crate::query_executor::StatementResult;
    use crate::session_store::{ListingMode, Session, SessionId, SessionState};

    fn sample_state() -> SessionState {
        let mut session = Session::new(SessionId::new(), "Tab 1", ConnectionProfile::default());
        session.query = "SELECT * FROM user".to_string();
        session.last_response = vec![StatementResult::ok(json!([{ "id": "user:1", "age": null }]))];

        let mut state = SessionState::default();
        state.active_session_id = Some(session.id);
        state.sessions.push(session);
        state.pinned = true;
        state.listing.mode = ListingMode::Favorites;
        state
    }

    #[test]
    fn missing_config_file_loads_empty_state() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let store = FileConfigStore::from_path(temp_dir.path().join("config.json"));

        let config = store.load().expect("failed to load config");
        assert!(config.state.sessions.is_empty());
        assert!(config.state.active_session_id.is_none());
    }

    #[test]
    fn save_and_reload_preserves_sessions_and_null_results() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("nested").join("config.json");
        let store = FileConfigStore::from_path(&path);

        let config = PersistedConfig::new(sample_state());
        store.save(&config).expect("failed to save config");

        let reloaded = store.load().expect("failed to reload config");
        assert_eq!(reloaded, config);
        assert_eq!(
            reloaded.state.sessions[0].last_response[0].result[0]["age"],
            serde_json::Value::Null
        );
    }

    #[test]
    fn validation_repairs_dangling_active_id_and_bad_variables() {
        let mut state = sample_state();
        state.sessions[0].variables = "[1, 2]".to_string();
        let duplicate = state.sessions[0].clone();
        state.sessions.push(duplicate);
        state.active_session_id = Some(SessionId::new());

        let store = MemoryConfigStore::with_config(PersistedConfig::new(state));
        let loaded = store.load().expect("memory load cannot fail");

        assert_eq!(loaded.state.sessions.len(), 1);
        assert_eq!(loaded.state.sessions[0].variables, "{}");
        assert!(loaded.state.active_session_id.is_none());
    }

    #[test]
    fn config_files_read_blank_as_absent() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("deep").join("notes.txt");
        assert_eq!(read_config_file(&path).expect("missing file is fine"), None);

        write_config_file(&path, "  \n").expect("failed to write file");
        assert_eq!(read_config_file(&path).expect("blank file is fine"), None);

        write_config_file(&path, "kept").expect("failed to write file");
        assert_eq!(
            read_config_file(&path).expect("failed to read file").as_deref(),
            Some("kept")
        );
    }

    #[test]
    fn unparseable_config_reports_path() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("failed to seed config");

        let err = FileConfigStore::from_path(&path)
            .load()
            .expect_err("garbage should not parse");
        assert!(err.to_string().contains("config.json"));
    }
}
