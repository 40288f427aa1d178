use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;
use thiserror::Error;

use crate::connection_manager::{ConnectionLease, TransportError};
use crate::statements::INFO_FOR_DB;

/// Substring of a table definition that marks it as a relation (edge) table.
pub const EDGE_MARKER: &str = "TYPE RELATION";
pub const SCHEMAFULL_MARKER: &str = "SCHEMAFULL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Table,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableMode {
    #[default]
    All,
    Table,
    Edge,
}

impl TableMode {
    #[must_use]
    pub fn admits(self, kind: TableKind) -> bool {
        match self {
            Self::All => true,
            Self::Table => kind == TableKind::Table,
            Self::Edge => kind == TableKind::Edge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub schemafull: bool,
    pub kind: TableKind,
    pub definition: String,
}

impl TableDescriptor {
    #[must_use]
    pub fn from_definition(name: impl Into<String>, definition: impl Into<String>) -> Self {
        let definition = definition.into();
        let upper = definition.to_ascii_uppercase();
        let kind = if upper.contains(EDGE_MARKER) {
            TableKind::Edge
        } else {
            TableKind::Table
        };
        Self {
            name: name.into(),
            schemafull: upper.contains(SCHEMAFULL_MARKER),
            kind,
            definition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaSnapshot {
    /// Builds a snapshot from the first statement of an `INFO FOR DB`
    /// response, keeping the order the database listed the tables in.
    pub fn from_info_result(result: &Value) -> Result<Self, SchemaCacheError> {
        let tables = result
            .get("tb")
            .or_else(|| result.get("tables"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                SchemaCacheError::UnexpectedResponse("missing table map".to_string())
            })?;

        let tables = tables
            .iter()
            .map(|(name, definition)| {
                let definition = match definition {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                TableDescriptor::from_definition(name.clone(), definition)
            })
            .collect();
        Ok(Self { tables })
    }

    pub fn tables(&self, mode: TableMode) -> impl Iterator<Item = &TableDescriptor> {
        self.tables
            .iter()
            .filter(move |table| mode.admits(table.kind))
    }

    #[must_use]
    pub fn table_names(&self, mode: TableMode) -> Vec<String> {
        self.tables(mode).map(|table| table.name.clone()).collect()
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|table| table.name == name)
    }
}

#[derive(Debug, Error)]
pub enum SchemaCacheError {
    #[error("schema query failed: {0}")]
    Transport(#[source] TransportError),
    #[error("schema query was rejected: {0}")]
    Rejected(String),
    #[error("unexpected schema response: {0}")]
    UnexpectedResponse(String),
}

/// Last successfully fetched schema. A failed refresh keeps the previous
/// snapshot.
#[derive(Debug, Default)]
pub struct SchemaCache {
    snapshot: Arc<SchemaSnapshot>,
    fetched_at: Option<SystemTime>,
}

impl SchemaCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        Arc::clone(&self.snapshot)
    }

    #[must_use]
    pub fn fetched_at(&self) -> Option<SystemTime> {
        self.fetched_at
    }

    pub fn invalidate(&mut self) {
        self.snapshot = Arc::new(SchemaSnapshot::default());
        self.fetched_at = None;
    }

    #[must_use]
    pub fn tables(&self, mode: TableMode) -> Vec<TableDescriptor> {
        self.snapshot.tables(mode).cloned().collect()
    }

    #[must_use]
    pub fn table_names(&self, mode: TableMode) -> Vec<String> {
        self.snapshot.table_names(mode)
    }

    #[tracing::instrument(skip_all)]
    pub async fn refresh(
        &mut self,
        lease: Option<&ConnectionLease>,
    ) -> Result<Arc<SchemaSnapshot>, SchemaCacheError> {
        let Some(lease) = lease.filter(|lease| lease.is_live()) else {
            tracing::debug!("no live connection, keeping previous schema");
            return Ok(self.snapshot());
        };

        let response = lease
            .transport()
            .query(INFO_FOR_DB, None)
            .await
            .map_err(SchemaCacheError::Transport)?;
        let first = response.first().ok_or_else(|| {
            SchemaCacheError::UnexpectedResponse("empty response".to_string())
        })?;
        if let Some(message) = first.error_message() {
            return Err(SchemaCacheError::Rejected(message.to_string()));
        }

        let snapshot = SchemaSnapshot::from_info_result(&first.result)?;
        if !lease.is_live() {
            tracing::debug!("connection changed during schema fetch, discarding result");
            return Ok(self.snapshot());
        }

        tracing::debug!(tables = snapshot.tables.len(), "schema refreshed");
        self.snapshot = Arc::new(snapshot);
        self.fetched_at = Some(SystemTime::now());
        Ok(self.snapshot())
    }
}
