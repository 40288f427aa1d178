use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/";
pub const DEFAULT_USERNAME: &str = "root";
pub const DEFAULT_PASSWORD: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("connection endpoint cannot be empty")]
    EmptyEndpoint,
    #[error("connection endpoint `{endpoint}` is not a valid URL: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("connection endpoint scheme `{0}` is not supported")]
    UnsupportedScheme(String),
}

/// Everything needed to reach one database: where it lives, who we are, and
/// which namespace/database the statements run against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

impl ConnectionProfile {
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: None,
            database: None,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self.normalized()
    }

    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self.normalized()
    }

    /// Blank optional scopes are treated as unset.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.namespace = non_empty(self.namespace.take());
        self.database = non_empty(self.database.take());
        self
    }

    pub fn validate(&self) -> Result<Url, ProfileError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ProfileError::EmptyEndpoint);
        }

        let url = Url::parse(endpoint).map_err(|source| ProfileError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            source,
        })?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            other => Err(ProfileError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT, DEFAULT_USERNAME, DEFAULT_PASSWORD)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
