use std::path::PathBuf;

use strata_core::profiles::{ConnectionProfile, DEFAULT_PASSWORD, DEFAULT_USERNAME};
use strata_core::schema_cache::TableMode;
use strata_core::statements::TableDefinition;
use thiserror::Error;

const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    Tabs,
    NewTab,
    SwitchTab(usize),
    RenameTab(String),
    CloseTab(Option<usize>),
    SaveConnection(ConnectionProfile),
    Connect,
    Disconnect,
    Status,
    SetQuery(String),
    SetVariables(String),
    Run,
    Exec(String),
    Tables(TableMode),
    Refresh,
    Define(TableDefinition),
    Pin,
    ToggleHistory,
    ToggleFavorites,
    SaveFavorite(String),
    RemoveFavorite(String),
    LoadFavorite(String),
    Recent(usize),
    ExportSchema(PathBuf),
    ExportResponse(PathBuf),
    ExportCsv { path: PathBuf, statement: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("`{command}` needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("`{0}` is not a positive number")]
    InvalidNumber(String),
    #[error("`{0}` is not a table mode (all, table, edge)")]
    InvalidTableMode(String),
    #[error("`{0}` is not an export kind (schema, response, csv)")]
    InvalidExportKind(String),
}

pub const HELP: &str = "\
tabs | new | switch <n> | rename <name> | close [n]
conn <endpoint> [user] [password] [namespace] [database]
connect | disconnect | status
query <text> | vars <json> | run | exec <text>
tables [all|table|edge] | refresh
define <name> [schemafull] | relate <name> <in,..> <out,..> [schemafull]
pin | history | favorites | fav <name> | unfav <name> | load <name> | recent [n]
export schema <path> | export response <path> | export csv <path> [statement]
help | quit";

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (keyword, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(keyword, rest)| (keyword, rest.trim()));
    let mut args = rest.split_whitespace();

    let command = match keyword {
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "tabs" => Command::Tabs,
        "new" => Command::NewTab,
        "switch" => Command::SwitchTab(position(args.next(), "switch", "a tab number")?),
        "rename" => Command::RenameTab(required(rest, "rename", "a name")?),
        "close" => Command::CloseTab(args.next().map(parse_position).transpose()?),
        "conn" => {
            let endpoint = args.next().ok_or(CommandError::MissingArgument {
                command: "conn",
                argument: "an endpoint",
            })?;
            let username = args.next().unwrap_or(DEFAULT_USERNAME);
            let password = args.next().unwrap_or(DEFAULT_PASSWORD);
            let mut profile = ConnectionProfile::new(endpoint, username, password);
            if let Some(namespace) = args.next() {
                profile = profile.with_namespace(namespace);
            }
            if let Some(database) = args.next() {
                profile = profile.with_database(database);
            }
            Command::SaveConnection(profile)
        }
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "status" => Command::Status,
        "query" => Command::SetQuery(rest.to_string()),
        "vars" => Command::SetVariables(rest.to_string()),
        "run" => Command::Run,
        "exec" => Command::Exec(required(rest, "exec", "a query")?),
        "tables" => Command::Tables(table_mode(args.next())?),
        "refresh" => Command::Refresh,
        "define" => {
            let name = args.next().ok_or(CommandError::MissingArgument {
                command: "define",
                argument: "a table name",
            })?;
            let definition = TableDefinition::table(name);
            Command::Define(if schemafull_flag(args.next()) {
                definition.schemafull()
            } else {
                definition
            })
        }
        "relate" => {
            let missing = |argument| CommandError::MissingArgument {
                command: "relate",
                argument,
            };
            let name = args.next().ok_or_else(|| missing("a relation name"))?;
            let relation_in = table_list(args.next().ok_or_else(|| missing("`in` tables"))?);
            let relation_out = table_list(args.next().ok_or_else(|| missing("`out` tables"))?);
            let definition = TableDefinition::relation(name, relation_in, relation_out);
            Command::Define(if schemafull_flag(args.next()) {
                definition.schemafull()
            } else {
                definition
            })
        }
        "pin" => Command::Pin,
        "history" => Command::ToggleHistory,
        "favorites" => Command::ToggleFavorites,
        "fav" => Command::SaveFavorite(required(rest, "fav", "a name")?),
        "unfav" => Command::RemoveFavorite(required(rest, "unfav", "a name")?),
        "load" => Command::LoadFavorite(required(rest, "load", "a name")?),
        "recent" => Command::Recent(
            args.next()
                .map(parse_position)
                .transpose()?
                .unwrap_or(DEFAULT_RECENT_LIMIT),
        ),
        "export" => {
            let kind = args.next().ok_or(CommandError::MissingArgument {
                command: "export",
                argument: "a kind",
            })?;
            let path = PathBuf::from(args.next().ok_or(CommandError::MissingArgument {
                command: "export",
                argument: "a path",
            })?);
            match kind {
                "schema" => Command::ExportSchema(path),
                "response" => Command::ExportResponse(path),
                "csv" => Command::ExportCsv {
                    path,
                    statement: args.next().map(parse_position).transpose()?.unwrap_or(1),
                },
                other => return Err(CommandError::InvalidExportKind(other.to_string())),
            }
        }
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn required(
    rest: &str,
    command: &'static str,
    argument: &'static str,
) -> Result<String, CommandError> {
    if rest.is_empty() {
        return Err(CommandError::MissingArgument { command, argument });
    }
    Ok(rest.to_string())
}

fn position(
    raw: Option<&str>,
    command: &'static str,
    argument: &'static str,
) -> Result<usize, CommandError> {
    raw.map(parse_position)
        .transpose()?
        .ok_or(CommandError::MissingArgument { command, argument })
}

fn parse_position(raw: &str) -> Result<usize, CommandError> {
    raw.parse::<usize>()
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| CommandError::InvalidNumber(raw.to_string()))
}

fn table_mode(raw: Option<&str>) -> Result<TableMode, CommandError> {
    match raw {
        None | Some("all") => Ok(TableMode::All),
        Some("table" | "tables") => Ok(TableMode::Table),
        Some("edge" | "edges") => Ok(TableMode::Edge),
        Some(other) => Err(CommandError::InvalidTableMode(other.to_string())),
    }
}

fn table_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|table| !table.is_empty())
        .map(str::to_string)
        .collect()
}

fn schemafull_flag(raw: Option<&str>) -> bool {
    raw.is_some_and(|flag| flag.eq_ignore_ascii_case("schemafull"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use strata_core::schema_cache::TableMode;
    use strata_core::statements::TableDefinition;

    use super::{parse_line, Command, CommandError};

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn query_text_keeps_inner_spacing() {
        assert_eq!(
            parse_line("query SELECT *  FROM user WHERE age > 3"),
            Ok(Some(Command::SetQuery(
                "SELECT *  FROM user WHERE age > 3".to_string()
            )))
        );
        assert_eq!(
            parse_line("vars {\"age\": 3}"),
            Ok(Some(Command::SetVariables("{\"age\": 3}".to_string())))
        );
    }

    #[test]
    fn conn_fills_default_credentials() {
        let Ok(Some(Command::SaveConnection(profile))) =
            parse_line("conn http://localhost:8000/")
        else {
            panic!("conn should parse");
        };
        assert_eq!(profile.endpoint, "http://localhost:8000/");
        assert_eq!(profile.username, "root");
        assert_eq!(profile.namespace, None);

        let Ok(Some(Command::SaveConnection(profile))) =
            parse_line("conn https://db.example.com admin secret test app")
        else {
            panic!("conn should parse");
        };
        assert_eq!(profile.password, "secret");
        assert_eq!(profile.namespace.as_deref(), Some("test"));
        assert_eq!(profile.database.as_deref(), Some("app"));
    }

    #[test]
    fn relate_splits_table_lists() {
        assert_eq!(
            parse_line("relate likes user post,comment schemafull"),
            Ok(Some(Command::Define(
                TableDefinition::relation(
                    "likes",
                    vec!["user".to_string()],
                    vec!["post".to_string(), "comment".to_string()],
                )
                .schemafull()
            )))
        );
    }

    #[test]
    fn tables_mode_and_numbers_are_validated() {
        assert_eq!(
            parse_line("tables edge"),
            Ok(Some(Command::Tables(TableMode::Edge)))
        );
        assert_eq!(
            parse_line("tables views"),
            Err(CommandError::InvalidTableMode("views".to_string()))
        );
        assert_eq!(
            parse_line("switch 0"),
            Err(CommandError::InvalidNumber("0".to_string()))
        );
        assert!(matches!(
            parse_line("switch"),
            Err(CommandError::MissingArgument { command: "switch", .. })
        ));
    }

    #[test]
    fn export_kinds_are_parsed() {
        assert_eq!(
            parse_line("export csv out.csv 2"),
            Ok(Some(Command::ExportCsv {
                path: PathBuf::from("out.csv"),
                statement: 2,
            }))
        );
        assert_eq!(
            parse_line("export schema schema.surql"),
            Ok(Some(Command::ExportSchema(PathBuf::from("schema.surql"))))
        );
        assert_eq!(
            parse_line("export pdf out.pdf"),
            Err(CommandError::InvalidExportKind("pdf".to_string()))
        );
    }

    #[test]
    fn unknown_keywords_are_rejected() {
        assert_eq!(
            parse_line("drop everything"),
            Err(CommandError::Unknown("drop".to_string()))
        );
    }
}
