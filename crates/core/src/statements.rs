use thiserror::Error;

use crate::schema_cache::TableKind;

pub const INFO_FOR_DB: &str = "INFO FOR DB";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatementError {
    #[error("table name cannot be empty")]
    EmptyTableName,
    #[error("relation `{0}` needs at least one `in` table and one `out` table")]
    MissingRelationEnds(String),
    #[error("relation end table name cannot be empty")]
    EmptyRelationEnd,
    #[error("table name `{0}` cannot contain whitespace")]
    WhitespaceInName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub kind: TableKind,
    pub schemafull: bool,
    pub relation_in: Vec<String>,
    pub relation_out: Vec<String>,
}

impl TableDefinition {
    #[must_use]
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Table,
            schemafull: false,
            relation_in: Vec::new(),
            relation_out: Vec::new(),
        }
    }

    #[must_use]
    pub fn relation(
        name: impl Into<String>,
        relation_in: Vec<String>,
        relation_out: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Edge,
            schemafull: false,
            relation_in,
            relation_out,
        }
    }

    #[must_use]
    pub fn schemafull(mut self) -> Self {
        self.schemafull = true;
        self
    }
}

/// Leaves plain identifiers alone and backtick-quotes the rest.
#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    let plain = identifier
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && identifier
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if plain {
        identifier.to_string()
    } else {
        format!("`{}`", identifier.replace('`', "\\`"))
    }
}

pub fn define_table_statement(definition: &TableDefinition) -> Result<String, StatementError> {
    let name = definition.name.trim();
    if name.is_empty() {
        return Err(StatementError::EmptyTableName);
    }
    if name.contains(char::is_whitespace) {
        return Err(StatementError::WhitespaceInName(name.to_string()));
    }
    let table = quote_identifier(name);

    let mut statement = format!("DEFINE TABLE {table}");
    if definition.kind == TableKind::Edge {
        statement.push_str(" TYPE RELATION");
    }
    statement.push_str(if definition.schemafull {
        " SCHEMAFULL;"
    } else {
        " SCHEMALESS;"
    });

    if definition.kind == TableKind::Edge {
        if definition.relation_in.is_empty() || definition.relation_out.is_empty() {
            return Err(StatementError::MissingRelationEnds(name.to_string()));
        }
        let ends_in = record_targets(&definition.relation_in)?;
        let ends_out = record_targets(&definition.relation_out)?;
        statement.push_str(&format!(
            "\nDEFINE FIELD in ON {table} TYPE record({ends_in});"
        ));
        statement.push_str(&format!(
            "\nDEFINE FIELD out ON {table} TYPE record({ends_out});"
        ));
    }

    Ok(statement)
}

fn record_targets(tables: &[String]) -> Result<String, StatementError> {
    let mut quoted = Vec::with_capacity(tables.len());
    for table in tables {
        let trimmed = table.trim();
        if trimmed.is_empty() {
            return Err(StatementError::EmptyRelationEnd);
        }
        if trimmed.contains(char::is_whitespace) {
            return Err(StatementError::WhitespaceInName(trimmed.to_string()));
        }
        quoted.push(quote_identifier(trimmed));
    }
    Ok(quoted.join(", "))
}
