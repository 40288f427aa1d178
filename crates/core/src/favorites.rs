use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config_store::{config_file_path, read_config_file, write_config_file, ConfigStoreError};

pub const FAVORITES_FILE: &str = "favorites.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FavoriteQuery {
    pub name: String,
    pub query: String,
}

impl FavoriteQuery {
    #[must_use]
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FavoritesError {
    #[error(transparent)]
    Store(#[from] ConfigStoreError),
    #[error("favorite name cannot be empty")]
    EmptyName,
    #[error("failed to parse favorites at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize favorites: {0}")]
    Serialize(#[source] toml::ser::Error),
}

/// File layout: one `[[favorites]]` table per saved query.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FavoritesFile {
    #[serde(default)]
    favorites: Vec<FavoriteQuery>,
}

/// Saved queries keyed by name, so listing order is alphabetical and a
/// repeated name in the file keeps its last query.
#[derive(Debug, Clone)]
pub struct FileFavoritesStore {
    path: PathBuf,
    queries: BTreeMap<String, String>,
}

impl FileFavoritesStore {
    pub fn load_default() -> Result<Self, FavoritesError> {
        Self::load_from_path(config_file_path(FAVORITES_FILE)?)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, FavoritesError> {
        let path = path.into();
        let queries = match read_config_file(&path)? {
            None => BTreeMap::new(),
            Some(raw) => {
                let file: FavoritesFile =
                    toml::from_str(&raw).map_err(|source| FavoritesError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                file.favorites
                    .into_iter()
                    .map(|favorite| (favorite.name, favorite.query))
                    .collect()
            }
        };
        tracing::debug!(path = %path.display(), count = queries.len(), "loaded favorites");
        Ok(Self { path, queries })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn favorites(&self) -> Vec<FavoriteQuery> {
        self.queries
            .iter()
            .map(|(name, query)| FavoriteQuery::new(name.as_str(), query.as_str()))
            .collect()
    }

    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.queries.get(name).map(String::as_str)
    }

    /// Saves `query` under `name`, replacing any query already saved there.
    pub fn upsert(&mut self, name: &str, query: &str) -> Result<(), FavoritesError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FavoritesError::EmptyName);
        }
        self.queries.insert(name.to_string(), query.to_string());
        Ok(())
    }

    #[must_use]
    pub fn remove(&mut self, name: &str) -> bool {
        self.queries.remove(name).is_some()
    }

    pub fn persist(&self) -> Result<(), FavoritesError> {
        let file = FavoritesFile {
            favorites: self.favorites(),
        };
        let rendered = toml::to_string_pretty(&file).map_err(FavoritesError::Serialize)?;
        write_config_file(&self.path, &rendered)?;
        Ok(())
    }
}
