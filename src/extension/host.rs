//! Host-runtime facilities the extension router depends on. Each is a
//! trait so the router can run against the real browser surface in
//! production and scripted fakes in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::debug;

/// A tab as the host tabs API reports it.
#[derive(Debug, Clone)]
pub struct HostTab {
    pub id: i64,
    pub index: i64,
    pub title: String,
    pub url: String,
}

impl HostTab {
    #[must_use]
    pub fn to_record(&self) -> Value {
        json!({
            "tabId": self.id,
            "index": self.index,
            "title": self.title,
            "url": self.url,
        })
    }
}

/// The browser surface: tabs, the debugger, and runtime control.
///
/// Errors are plain strings; they travel to the broker verbatim inside
/// JSON-RPC error payloads.
#[async_trait]
pub trait BrowserHost: Send + Sync {
    async fn list_tabs(&self) -> Result<Vec<HostTab>, String>;
    async fn create_tab(&self, url: Option<&str>) -> Result<HostTab, String>;
    async fn close_tab(&self, tab_id: i64) -> Result<(), String>;
    async fn activate_tab(&self, tab_id: i64) -> Result<(), String>;

    /// Attach the debugger to a tab. At most one tab is attached per
    /// browser; the router enforces the policy, the host reports
    /// conflicts (e.g. DevTools already attached).
    async fn attach_debugger(&self, tab_id: i64) -> Result<(), String>;
    async fn detach_debugger(&self, tab_id: i64) -> Result<(), String>;

    /// Forward one CDP command to an attached tab.
    async fn send_cdp(&self, tab_id: i64, method: &str, params: Value) -> Result<Value, String>;

    /// Installed-extension inventory, when the host exposes it.
    async fn list_extensions(&self) -> Result<Value, String> {
        Ok(json!([]))
    }

    /// Downscale a base64 image to fit `max_dimension`. Hosts without a
    /// canvas return the input unchanged.
    async fn resize_image(
        &self,
        data: String,
        _mime_type: &str,
        _max_dimension: u32,
    ) -> Result<String, String> {
        Ok(data)
    }

    /// Restart the extension runtime (hot reload). Best-effort.
    fn reload_runtime(&self) {}
}

/// Named one-shot alarms. The host scheduler survives worker
/// suspension, which in-process timers do not; every recovery timer
/// goes through here.
pub trait AlarmScheduler: Send + Sync {
    fn schedule(&self, name: &str, delay: Duration);
    fn cancel(&self, name: &str);
}

/// Session-scoped storage for the router's persisted state.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Option<Value>;
    fn save(&self, state: &Value);
    fn clear(&self);
}

/// Toolbar indicator sink.
pub trait BadgeSurface: Send + Sync {
    fn set_indicator(&self, attached: bool, stealth: bool);
}

// ===========================================================================
// Production-shaped implementations
// ===========================================================================

/// Alarm scheduler backed by tokio timers, delivering fires over a
/// channel. Re-scheduling or cancelling a name supersedes the earlier
/// alarm via a per-name generation counter.
pub struct TokioAlarms {
    fire_tx: mpsc::UnboundedSender<String>,
    generations: std::sync::Arc<Mutex<HashMap<String, u64>>>,
}

impl TokioAlarms {
    /// Returns the scheduler and the receiver the router listens on.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        (
            Self {
                fire_tx,
                generations: std::sync::Arc::new(Mutex::new(HashMap::new())),
            },
            fire_rx,
        )
    }

    fn bump(&self, name: &str) -> u64 {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = generations.get(name).copied().unwrap_or(0) + 1;
        generations.insert(name.to_owned(), next);
        next
    }
}

impl AlarmScheduler for TokioAlarms {
    fn schedule(&self, name: &str, delay: Duration) {
        let generation = self.bump(name);
        let fire_tx = self.fire_tx.clone();
        let generations = std::sync::Arc::clone(&self.generations);
        let name = name.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = generations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&name)
                .copied()
                .unwrap_or(0);
            if current == generation {
                let _ = fire_tx.send(name);
            }
        });
    }

    fn cancel(&self, name: &str) {
        self.bump(name);
    }
}

/// Manual alarm scheduler for tests: records schedules, fires on
/// demand.
pub struct ManualAlarms {
    fire_tx: mpsc::UnboundedSender<String>,
    scheduled: Mutex<Vec<(String, Duration)>>,
}

impl ManualAlarms {
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        (
            Self {
                fire_tx,
                scheduled: Mutex::new(Vec::new()),
            },
            fire_rx,
        )
    }

    /// Names currently scheduled, in order.
    #[must_use]
    pub fn scheduled_names(&self) -> Vec<String> {
        self.scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fire a scheduled alarm by name.
    pub fn fire(&self, name: &str) {
        let mut scheduled = self
            .scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        scheduled.retain(|(n, _)| n != name);
        let _ = self.fire_tx.send(name.to_owned());
    }
}

impl AlarmScheduler for ManualAlarms {
    fn schedule(&self, name: &str, delay: Duration) {
        self.scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((name.to_owned(), delay));
    }

    fn cancel(&self, name: &str) {
        self.scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(n, _)| n != name);
    }
}

/// In-memory session store (tests, and hosts without storage).
#[derive(Default)]
pub struct InMemorySessionStore {
    state: Mutex<Option<Value>>,
}

impl SessionStore for InMemorySessionStore {
    fn load(&self) -> Option<Value> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn save(&self, state: &Value) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(state.clone());
    }

    fn clear(&self) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

/// Session store backed by a JSON file, for hosts that persist across
/// process restarts. All operations are best-effort: a broken file is
/// treated as absent.
pub struct FileSessionStore {
    path: std::path::PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }

    /// Default location under the user data dir.
    #[must_use]
    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::data_dir().map(|dir| dir.join("supersurf").join("session_state.json"))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<Value> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn save(&self, state: &Value) {
        if let Some(parent) = self.path.parent()
            && std::fs::create_dir_all(parent).is_err()
        {
            return;
        }
        if let Ok(text) = serde_json::to_string(state)
            && std::fs::write(&self.path, text).is_err()
        {
            debug!("session state write failed");
        }
    }

    fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Badge sink that only logs. Hosts with a real toolbar wire their own.
#[derive(Default)]
pub struct LogBadge;

impl BadgeSurface for LogBadge {
    fn set_indicator(&self, attached: bool, stealth: bool) {
        debug!(attached, stealth, "badge indicator");
    }
}
