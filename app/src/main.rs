use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use strata_adapters::http::HttpBackend;
use strata_core::config_store::{default_config_dir, FileConfigStore, CONFIG_FILE};
use strata_core::favorites::{FileFavoritesStore, FAVORITES_FILE};
use strata_core::platform::HeadlessWindow;
use strata_core::query_history::{FileQueryHistory, HISTORY_FILE};
use strata_core::session_store::SessionStore;
use strata_core::workbench::Workbench;
use strata_shell::{NoticeQueue, Shell};
use tokio::io::AsyncBufRead;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "STRATA_LOG";

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_shell(config_dir: &Path) -> Result<Shell<HttpBackend>, Box<dyn Error>> {
    let config = FileConfigStore::from_path(config_dir.join(CONFIG_FILE));
    let sessions = SessionStore::load(Box::new(config), Arc::new(HeadlessWindow))?;
    let favorites = FileFavoritesStore::load_from_path(config_dir.join(FAVORITES_FILE))?;
    let history = FileQueryHistory::from_path(config_dir.join(HISTORY_FILE));

    let notices = Arc::new(NoticeQueue::default());
    let workbench = Workbench::new(sessions, HttpBackend::new()?, notices.clone())
        .with_history(history)
        .with_favorites(favorites);
    tracing::info!(config_dir = %config_dir.display(), "workbench ready");
    Ok(Shell::new(workbench, notices))
}

async fn run_app<R, W>(
    config_dir: &Path,
    input: R,
    out: &mut W,
) -> Result<(), Box<dyn Error>>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut shell = open_shell(config_dir)?;
    shell.start().await?;
    shell.run(input, out).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config_dir = default_config_dir()?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    run_app(&config_dir, stdin, &mut stdout).await
}
