use crate::session_store::SessionState;

pub const APP_TITLE: &str = "Strata";

/// Host window capabilities. Every capability defaults to unsupported so a
/// headless host only overrides what it actually has.
pub trait WindowAdapter: Send + Sync {
    fn is_pinning_supported(&self) -> bool {
        false
    }

    fn toggle_pinned(&self) {}

    fn is_serve_supported(&self) -> bool {
        false
    }

    fn set_title(&self, _title: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCapabilities {
    pub pinning: bool,
    pub serve: bool,
}

impl WindowCapabilities {
    #[must_use]
    pub fn of(window: &dyn WindowAdapter) -> Self {
        Self {
            pinning: window.is_pinning_supported(),
            serve: window.is_serve_supported(),
        }
    }
}

impl WindowAdapter for HeadlessWindow {}

#[must_use]
pub fn window_title(state: &SessionState) -> String {
    let Some(session) = state
        .active_session_id
        .and_then(|id| state.sessions.iter().find(|session| session.id == id))
    else {
        return APP_TITLE.to_string();
    };

    let mut title = format!("{APP_TITLE} - {}", session.name);
    if state.pinned {
        title.push_str(" (Pinned)");
    }
    title
}
