//! Line-oriented front end over a [`Workbench`].
//!
//! Input lines are mapped to [`Command`]s and applied one at a time. While
//! waiting for input the shell also listens for connection events, so a
//! dropped connection is reported as soon as it happens.

pub mod command;

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_adapters::export::{export_response, export_result_to_csv, export_schema, ExportError};
use strata_core::connection_manager::{
    ConnectionBackend, ConnectionEvent, ConnectionEventKind, ConnectionState,
};
use strata_core::notifications::{Notice, NotificationSink};
use strata_core::query_executor::StatementResult;
use strata_core::session_store::SessionId;
use strata_core::workbench::{SendOutcome, Workbench, WorkbenchError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub use command::{parse_line, Command, CommandError, HELP};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Workbench(#[from] WorkbenchError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("{0}")]
    Usage(String),
}

/// Collects notices until the shell prints them.
#[derive(Debug, Default)]
pub struct NoticeQueue {
    notices: Mutex<Vec<Notice>>,
}

impl NoticeQueue {
    #[must_use]
    pub fn take(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock())
    }
}

impl NotificationSink for NoticeQueue {
    fn notify(&self, notice: Notice) {
        tracing::debug!(%notice, "notice queued");
        self.notices.lock().push(notice);
    }
}

pub struct Shell<B: ConnectionBackend> {
    workbench: Workbench<B>,
    notices: Arc<NoticeQueue>,
    should_quit: bool,
}

impl<B: ConnectionBackend> std::fmt::Debug for Shell<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("workbench", &self.workbench)
            .field("should_quit", &self.should_quit)
            .finish_non_exhaustive()
    }
}

impl<B: ConnectionBackend> Shell<B> {
    /// `notices` must be the sink `workbench` was built with.
    #[must_use]
    pub fn new(workbench: Workbench<B>, notices: Arc<NoticeQueue>) -> Self {
        Self {
            workbench,
            notices,
            should_quit: false,
        }
    }

    #[must_use]
    pub fn workbench(&self) -> &Workbench<B> {
        &self.workbench
    }

    /// Makes sure a tab is active, reusing the first saved tab when there is
    /// one.
    pub async fn start(&mut self) -> Result<(), ShellError> {
        if self.workbench.active_session().is_some() {
            return Ok(());
        }
        let first = self
            .workbench
            .state()
            .sessions
            .first()
            .map(|session| session.id);
        match first {
            Some(id) => self.workbench.switch_session(id).await?,
            None => {
                self.workbench.create_session().await?;
            }
        }
        Ok(())
    }

    pub async fn run<R, W>(&mut self, input: R, out: &mut W) -> Result<(), ShellError>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        writeln!(out, "type `help` for commands")?;

        while !self.should_quit {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    self.handle_line(&line, out).await?;
                }
                events = self.workbench.wait_events() => {
                    self.workbench.handle_events(events.clone()).await;
                    render_events(&events, out)?;
                    self.flush_notices(out)?;
                }
            }
        }
        tracing::info!("shell finished");
        Ok(())
    }

    pub async fn handle_line<W: Write>(
        &mut self,
        line: &str,
        out: &mut W,
    ) -> Result<(), ShellError> {
        let result = match parse_line(line) {
            Ok(None) => return Ok(()),
            Ok(Some(command)) => self.handle(command, out).await,
            Err(error) => Err(ShellError::Usage(error.to_string())),
        };

        match result {
            Err(ShellError::Io(error)) => return Err(ShellError::Io(error)),
            Err(error) => writeln!(out, "error: {error}")?,
            Ok(()) => {}
        }
        self.flush_notices(out)
    }

    async fn handle<W: Write>(
        &mut self,
        command: Command,
        out: &mut W,
    ) -> Result<(), ShellError> {
        match command {
            Command::Help => writeln!(out, "{HELP}")?,
            Command::Quit => self.should_quit = true,
            Command::Tabs => self.render_tabs(out)?,
            Command::NewTab => {
                self.workbench.create_session().await?;
                self.render_tabs(out)?;
            }
            Command::SwitchTab(position) => {
                let id = self.tab_at(position)?;
                self.workbench.switch_session(id).await?;
                self.render_tabs(out)?;
            }
            Command::RenameTab(name) => self.workbench.rename_session(&name)?,
            Command::CloseTab(position) => {
                let id = match position {
                    Some(position) => self.tab_at(position)?,
                    None => self
                        .workbench
                        .active_session()
                        .map(|session| session.id)
                        .ok_or(WorkbenchError::NoActiveSession)?,
                };
                self.workbench.remove_session(id).await?;
                self.render_tabs(out)?;
            }
            Command::SaveConnection(profile) => {
                self.workbench.save_connection_details(profile).await?;
                writeln!(out, "connection details saved")?;
            }
            Command::Connect => {
                self.workbench.connect().await?;
                while self.workbench.connection_state() == ConnectionState::Connecting {
                    let events = self.workbench.pump_events().await;
                    render_events(&events, out)?;
                    self.flush_notices(out)?;
                }
            }
            Command::Disconnect => self.workbench.disconnect().await?,
            Command::Status => self.render_status(out)?,
            Command::SetQuery(query) => self.workbench.set_query(&query)?,
            Command::SetVariables(variables) => {
                self.workbench.set_variables(&variables)?;
                if self.workbench.variables_invalid() {
                    writeln!(out, "variables must be a JSON object; kept the previous value")?;
                }
            }
            Command::Run => {
                let outcome = self.workbench.send_query().await?;
                render_outcome(&outcome, out)?;
            }
            Command::Exec(query) => {
                let variables = self
                    .workbench
                    .active_session()
                    .map(|session| session.variables.clone())
                    .unwrap_or_default();
                let outcome = self.workbench.send_query_text(&query, &variables).await?;
                render_outcome(&outcome, out)?;
            }
            Command::Tables(mode) => {
                for table in self.workbench.tables(mode) {
                    let shape = if table.schemafull { "schemafull" } else { "schemaless" };
                    writeln!(out, "{:<24} {:?} {shape}", table.name, table.kind)?;
                }
            }
            Command::Refresh => {
                let snapshot = self.workbench.refresh_schema().await?;
                writeln!(out, "{} tables", snapshot.tables.len())?;
            }
            Command::Define(definition) => {
                self.workbench.create_table(&definition).await?;
                writeln!(out, "defined {}", definition.name)?;
            }
            Command::Pin => {
                let pinned = self.workbench.toggle_pinned()?;
                writeln!(out, "{}", if pinned { "pinned" } else { "unpinned" })?;
            }
            Command::ToggleHistory => {
                if self.workbench.toggle_history()? {
                    self.render_history(10, out)?;
                }
            }
            Command::ToggleFavorites => {
                if self.workbench.toggle_favorites()? {
                    for favorite in self.workbench.favorites() {
                        writeln!(out, "{:<20} {}", favorite.name, favorite.query)?;
                    }
                }
            }
            Command::SaveFavorite(name) => {
                self.workbench.save_favorite(&name)?;
                writeln!(out, "saved favorite `{name}`")?;
            }
            Command::RemoveFavorite(name) => {
                if !self.workbench.remove_favorite(&name)? {
                    writeln!(out, "no favorite named `{name}`")?;
                }
            }
            Command::LoadFavorite(name) => {
                if !self.workbench.load_favorite(&name)? {
                    writeln!(out, "no favorite named `{name}`")?;
                }
            }
            Command::Recent(limit) => self.render_history(limit, out)?,
            Command::ExportSchema(path) => {
                let written = export_schema(&path, &self.workbench.schema())?;
                writeln!(out, "exported {written} tables to {}", path.display())?;
            }
            Command::ExportResponse(path) => {
                let written = export_response(&path, self.last_response()?)?;
                writeln!(out, "exported {written} statements to {}", path.display())?;
            }
            Command::ExportCsv { path, statement } => {
                let record = self.last_response()?.get(statement - 1).ok_or_else(|| {
                    ShellError::Usage(format!("the last response has no statement {statement}"))
                })?;
                let written = export_result_to_csv(&path, &record.result)?;
                writeln!(out, "exported {written} rows to {}", path.display())?;
            }
        }
        Ok(())
    }

    fn tab_at(&self, position: usize) -> Result<SessionId, ShellError> {
        self.workbench
            .state()
            .sessions
            .get(position - 1)
            .map(|session| session.id)
            .ok_or_else(|| ShellError::Usage(format!("there is no tab {position}")))
    }

    fn last_response(&self) -> Result<&[StatementResult], ShellError> {
        let session = self
            .workbench
            .active_session()
            .ok_or(WorkbenchError::NoActiveSession)?;
        Ok(session.last_response.as_slice())
    }

    fn render_tabs<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let state = self.workbench.state();
        for (index, session) in state.sessions.iter().enumerate() {
            let marker = if state.active_session_id == Some(session.id) {
                '*'
            } else {
                ' '
            };
            writeln!(
                out,
                "{marker} {} {:<16} {}",
                index + 1,
                session.name,
                session.connection.endpoint
            )?;
        }
        Ok(())
    }

    fn render_status<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let status = self.workbench.connection_status();
        write!(out, "{:?}", status.state)?;
        if let Some(endpoint) = &status.endpoint {
            write!(out, " {endpoint}")?;
        }
        if let Some(handle) = status.handle {
            write!(out, " {}", handle.id)?;
        }
        if let Some(latency) = status.last_latency {
            write!(out, " {}ms", latency.as_millis())?;
        }
        writeln!(out)?;

        let capabilities = self.workbench.window_capabilities();
        writeln!(
            out,
            "pinning {}, local serve {}",
            availability(capabilities.pinning),
            availability(capabilities.serve)
        )
    }

    fn render_history<W: Write>(&self, limit: usize, out: &mut W) -> Result<(), ShellError> {
        for entry in self.workbench.recent_history(limit)? {
            let elapsed = entry
                .elapsed_ms
                .map_or_else(String::new, |elapsed| format!(" {elapsed}ms"));
            writeln!(out, "{:?}{elapsed} {}", entry.outcome, entry.query)?;
        }
        Ok(())
    }

    fn flush_notices<W: Write>(&self, out: &mut W) -> Result<(), ShellError> {
        for notice in self.notices.take() {
            writeln!(out, "! {notice}")?;
        }
        Ok(())
    }
}

fn availability(supported: bool) -> &'static str {
    if supported {
        "available"
    } else {
        "unavailable"
    }
}

fn render_events<W: Write>(events: &[ConnectionEvent], out: &mut W) -> io::Result<()> {
    for event in events {
        match &event.kind {
            ConnectionEventKind::Connected => writeln!(out, "connected {}", event.handle.id)?,
            ConnectionEventKind::Disconnected => {
                writeln!(out, "disconnected {}", event.handle.id)?;
            }
            ConnectionEventKind::Error { .. } => {}
        }
    }
    Ok(())
}

fn render_outcome<W: Write>(outcome: &SendOutcome, out: &mut W) -> Result<(), ShellError> {
    match outcome {
        SendOutcome::Applied(outcome) => {
            for (index, record) in outcome.records.iter().enumerate() {
                writeln!(out, "-- statement {}: {} {}", index + 1, record.status, record.time)?;
                let rendered = serde_json::to_string_pretty(&record.result)
                    .map_err(|error| ShellError::Usage(error.to_string()))?;
                writeln!(out, "{rendered}")?;
            }
        }
        SendOutcome::Discarded => writeln!(out, "result discarded; the connection changed")?,
        SendOutcome::Rejected(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use strata_core::config_store::MemoryConfigStore;
    use strata_core::connection_manager::{ConnectionBackend, TransportError};
    use strata_core::platform::HeadlessWindow;
    use strata_core::profiles::ConnectionProfile;
    use strata_core::query_executor::{QueryTransport, StatementResult, Variables};
    use strata_core::session_store::SessionStore;
    use strata_core::statements::INFO_FOR_DB;
    use strata_core::workbench::Workbench;
    use tempfile::TempDir;

    use super::{NoticeQueue, Shell};

    #[derive(Debug, Default)]
    struct StaticBackend;

    #[derive(Debug)]
    struct StaticConnection;

    #[async_trait::async_trait]
    impl QueryTransport for StaticConnection {
        async fn query(
            &self,
            statement: &str,
            _variables: Option<&Variables>,
        ) -> Result<Vec<StatementResult>, TransportError> {
            if statement == INFO_FOR_DB {
                return Ok(vec![StatementResult::ok(json!({
                    "tb": {
                        "user": "DEFINE TABLE user SCHEMAFULL",
                        "likes": "DEFINE TABLE likes TYPE RELATION SCHEMALESS",
                    }
                }))]);
            }
            Ok(vec![StatementResult::ok(json!([{ "id": "user:tobie" }]))])
        }
    }

    #[async_trait::async_trait]
    impl ConnectionBackend for StaticBackend {
        type Connection = StaticConnection;

        async fn connect(
            &self,
            _profile: &ConnectionProfile,
        ) -> Result<Self::Connection, TransportError> {
            Ok(StaticConnection)
        }

        async fn disconnect(
            &self,
            _connection: Arc<Self::Connection>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn shell() -> Shell<StaticBackend> {
        let store = SessionStore::load(
            Box::new(MemoryConfigStore::new()),
            Arc::new(HeadlessWindow),
        )
        .expect("memory store should load");
        let notices = Arc::new(NoticeQueue::default());
        let workbench = Workbench::new(store, StaticBackend, notices.clone());
        let mut shell = Shell::new(workbench, notices);
        shell.start().await.expect("start should create a tab");
        shell
    }

    async fn run_script(shell: &mut Shell<StaticBackend>, script: &str) -> String {
        let mut out = Vec::new();
        shell
            .run(script.as_bytes(), &mut out)
            .await
            .expect("shell should run");
        String::from_utf8(out).expect("output should be utf-8")
    }

    #[tokio::test]
    async fn start_creates_a_first_tab() {
        let shell = shell().await;
        assert_eq!(shell.workbench().state().sessions.len(), 1);
        assert!(shell.workbench().active_session().is_some());
    }

    #[tokio::test]
    async fn running_offline_prints_notice() {
        let mut shell = shell().await;
        let output = run_script(&mut shell, "query SELECT * FROM user\nrun\n").await;
        assert!(output.contains("! Query Failed: You must be connected to send a query"));
    }

    #[tokio::test]
    async fn connect_run_and_list_tables() {
        let mut shell = shell().await;
        let output = run_script(
            &mut shell,
            "query SELECT * FROM user\nconnect\nrun\ntables edge\nstatus\nquit\nrun\n",
        )
        .await;

        assert!(output.contains("connected #1"));
        assert!(output.contains("-- statement 1: OK"));
        assert!(output.contains("\"user:tobie\""));
        assert!(output.contains("likes"));
        assert!(output.contains("Connected http://localhost:8000/ #1"));
        assert!(output.contains("pinning unavailable, local serve unavailable"));
        assert_eq!(output.matches("-- statement").count(), 1);
    }

    #[tokio::test]
    async fn usage_errors_do_not_stop_the_shell() {
        let mut shell = shell().await;
        let output = run_script(&mut shell, "switch 9\nfrobnicate\nnew\ntabs\n").await;

        assert!(output.contains("error: there is no tab 9"));
        assert!(output.contains("error: unknown command `frobnicate`"));
        assert!(output.contains("* 2 Tab 2"));
        assert_eq!(shell.workbench().state().sessions.len(), 2);
    }

    #[tokio::test]
    async fn exports_last_response() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("response.json");
        let mut shell = shell().await;

        let output = run_script(
            &mut shell,
            &format!("connect\nexec SELECT * FROM user\nexport response {}\n", path.display()),
        )
        .await;

        assert!(output.contains("exported 1 statements"));
        let written = std::fs::read_to_string(path).expect("export should exist");
        assert!(written.contains("user:tobie"));
    }
}
