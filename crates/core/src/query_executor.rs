use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::connection_manager::{ConnectionHandle, ConnectionLease, TransportError};
use crate::session_store::SessionId;

pub type Variables = Map<String, Value>;

/// One statement's outcome as reported by the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatementResult {
    #[serde(default)]
    pub result: Value,
    pub status: String,
    #[serde(default)]
    pub time: String,
}

impl StatementResult {
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            status: "OK".to_string(),
            time: String::new(),
        }
    }

    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: Value::String(message.into()),
            status: "ERR".to_string(),
            time: String::new(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }

    /// The error text of a failed statement, if the database sent one.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        if self.is_ok() {
            return None;
        }
        Some(self.result.as_str().unwrap_or(self.status.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidVariablesError {
    #[error("variables are not valid JSON: {0}")]
    Malformed(String),
    #[error("variables must be a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// Parses the variables editor text. Blank text and `{}` both mean "no
/// variables".
pub fn parse_variables(text: &str) -> Result<Option<Variables>, InvalidVariablesError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let parsed: Value = serde_json::from_str(trimmed)
        .map_err(|error| InvalidVariablesError::Malformed(error.to_string()))?;

    match parsed {
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        Value::Array(_) => Err(InvalidVariablesError::NotAnObject("an array")),
        Value::String(_) => Err(InvalidVariablesError::NotAnObject("a string")),
        Value::Number(_) => Err(InvalidVariablesError::NotAnObject("a number")),
        Value::Bool(_) => Err(InvalidVariablesError::NotAnObject("a boolean")),
        Value::Null => Err(InvalidVariablesError::NotAnObject("null")),
    }
}

#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn query(
        &self,
        statement: &str,
        variables: Option<&Variables>,
    ) -> Result<Vec<StatementResult>, TransportError>;
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("You must be connected to send a query")]
    NotConnected,
    #[error(transparent)]
    InvalidVariables(#[from] InvalidVariablesError),
    #[error("a query is already running for session {0}")]
    Busy(SessionId),
    #[error("query transport failed: {0}")]
    Transport(#[source] TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub session_id: SessionId,
    pub handle: ConnectionHandle,
    pub records: Vec<StatementResult>,
    pub elapsed: Duration,
}

impl QueryOutcome {
    #[must_use]
    pub fn failed_statements(&self) -> usize {
        self.records.iter().filter(|record| !record.is_ok()).count()
    }
}

/// Runs queries over a leased connection, one at a time per session.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    in_flight: Arc<Mutex<HashSet<SessionId>>>,
}

struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<SessionId>>>,
    session_id: SessionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.session_id);
    }
}

impl QueryExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_running(&self, session_id: SessionId) -> bool {
        self.in_flight.lock().contains(&session_id)
    }

    #[tracing::instrument(skip_all, fields(session_id = %session_id))]
    pub async fn execute(
        &self,
        lease: Option<&ConnectionLease>,
        session_id: SessionId,
        query: &str,
        variables: &str,
    ) -> Result<QueryOutcome, QueryError> {
        let lease = lease
            .filter(|lease| lease.is_live())
            .ok_or(QueryError::NotConnected)?;
        let variables = parse_variables(variables)?;
        let _guard = self.begin(session_id)?;

        let started_at = Instant::now();
        let records = lease
            .transport()
            .query(query, variables.as_ref())
            .await
            .map_err(|error| {
                tracing::warn!(%error, "query transport failed");
                QueryError::Transport(error)
            })?;

        let elapsed = started_at.elapsed();
        tracing::debug!(
            statements = records.len(),
            elapsed_ms = elapsed.as_millis(),
            "query completed"
        );

        Ok(QueryOutcome {
            session_id,
            handle: lease.handle(),
            records,
            elapsed,
        })
    }

    fn begin(&self, session_id: SessionId) -> Result<InFlightGuard, QueryError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(session_id) {
            return Err(QueryError::Busy(session_id));
        }
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            session_id,
        })
    }
}
