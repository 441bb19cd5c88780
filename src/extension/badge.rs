//! Toolbar indicator bookkeeping: keeps the badge in sync with the
//! attached tab and stealth mode as tabs activate and close.

use std::sync::Arc;

use super::host::BadgeSurface;
use super::session::Session;

/// Tracks what the indicator currently shows and pushes updates to the
/// surface only when something changed.
pub struct BadgeManager {
    surface: Arc<dyn BadgeSurface>,
    last: std::sync::Mutex<Option<(bool, bool)>>,
}

impl BadgeManager {
    #[must_use]
    pub fn new(surface: Arc<dyn BadgeSurface>) -> Self {
        Self {
            surface,
            last: std::sync::Mutex::new(None),
        }
    }

    /// Sync the indicator from session state. Best-effort by contract:
    /// the surface may drop updates.
    pub fn sync(&self, session: &Session) {
        let state = (session.attached_tab_id.is_some(), session.stealth_mode);
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *last == Some(state) {
            return;
        }
        *last = Some(state);
        self.surface.set_indicator(state.0, state.1);
    }

    /// A tab went away; if it was the attached one the caller has
    /// already cleared the session, so a plain sync suffices.
    pub fn on_tab_removed(&self, session: &Session, removed_tab_id: i64) {
        if session.attached_tab_id == Some(removed_tab_id) {
            // Stale attachment; show detached until the session catches up.
            self.surface.set_indicator(false, session.stealth_mode);
            *self
                .last
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) =
                Some((false, session.stealth_mode));
        } else {
            self.sync(session);
        }
    }
}
