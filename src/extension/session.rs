//! Multi-session state on the extension side, keyed by ClientID with a
//! reserved `None` key for the default session. Every mutation is
//! persisted opportunistically so state survives worker suspensions.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::warn;

use crate::humanize::Personality;

use super::host::SessionStore;

/// Storage key for the persisted router state.
pub const SESSION_STATE_KEY: &str = "__supersurf_session_state";

/// Placeholder for the `None` client id in serialized form.
const NULL_KEY: &str = "__null__";

/// Per-tab cursor position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Humanized-motion settings for one session.
#[derive(Debug, Clone, Default)]
pub struct HumanizationConfig {
    pub enabled: bool,
    pub personality: Option<Personality>,
}

/// One client's session state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub attached_tab_id: Option<i64>,
    pub stealth_mode: bool,
    pub stealth_tabs: HashMap<i64, bool>,
    pub cursor_positions: HashMap<i64, CursorPosition>,
    pub humanization: HumanizationConfig,
}

impl Session {
    fn to_json(&self) -> Value {
        let stealth_tabs: Vec<Value> = self
            .stealth_tabs
            .iter()
            .map(|(tab, on)| json!([tab, on]))
            .collect();
        let cursor_positions: Vec<Value> = self
            .cursor_positions
            .iter()
            .map(|(tab, pos)| json!([tab, {"x": pos.x, "y": pos.y}]))
            .collect();
        json!({
            "attachedTabId": self.attached_tab_id,
            "stealthMode": self.stealth_mode,
            "stealthTabs": stealth_tabs,
            "cursorPositions": cursor_positions,
            "humanizationConfig": {
                "enabled": self.humanization.enabled,
                "personality": self.humanization.personality.map(|p| json!({
                    "speedMultiplier": p.speed_multiplier,
                    "overshootTendency": p.overshoot_tendency,
                    "curvatureBias": p.curvature_bias,
                    "jitterPx": p.jitter_px,
                })),
            },
        })
    }

    /// Tolerant read: every missing subfield falls back to its default
    /// so older persisted blobs still load.
    fn from_json(value: &Value) -> Self {
        let mut session = Self {
            attached_tab_id: value.get("attachedTabId").and_then(Value::as_i64),
            stealth_mode: value
                .get("stealthMode")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ..Self::default()
        };
        if let Some(pairs) = value.get("stealthTabs").and_then(Value::as_array) {
            for pair in pairs {
                if let (Some(tab), Some(on)) = (
                    pair.get(0).and_then(Value::as_i64),
                    pair.get(1).and_then(Value::as_bool),
                ) {
                    session.stealth_tabs.insert(tab, on);
                }
            }
        }
        if let Some(pairs) = value.get("cursorPositions").and_then(Value::as_array) {
            for pair in pairs {
                if let (Some(tab), Some(pos)) = (pair.get(0).and_then(Value::as_i64), pair.get(1)) {
                    let x = pos.get("x").and_then(Value::as_f64).unwrap_or(0.0);
                    let y = pos.get("y").and_then(Value::as_f64).unwrap_or(0.0);
                    session
                        .cursor_positions
                        .insert(tab, CursorPosition { x, y });
                }
            }
        }
        if let Some(config) = value.get("humanizationConfig") {
            session.humanization.enabled = config
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if let Some(p) = config.get("personality").filter(|p| !p.is_null()) {
                session.humanization.personality = Some(Personality {
                    speed_multiplier: p
                        .get("speedMultiplier")
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0),
                    overshoot_tendency: p
                        .get("overshootTendency")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.5),
                    curvature_bias: p
                        .get("curvatureBias")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.5),
                    jitter_px: p.get("jitterPx").and_then(Value::as_f64).unwrap_or(1.0),
                });
            }
        }
        session
    }
}

/// All router state worth surviving a worker suspension.
pub struct SessionContext {
    sessions: HashMap<Option<String>, Session>,
    pub connected: bool,
    pub debugger_attached: bool,
    pub current_debugger_tab: Option<i64>,
    store: Arc<dyn SessionStore>,
}

impl SessionContext {
    /// Create a context, rehydrating from the store when a prior state
    /// blob exists.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let mut context = Self {
            sessions: HashMap::new(),
            connected: false,
            debugger_attached: false,
            current_debugger_tab: None,
            store,
        };
        if let Some(state) = context.store.load() {
            context.rehydrate(&state);
        }
        context
    }

    /// The session for a client id, lazily created.
    pub fn session_mut(&mut self, client_id: Option<&str>) -> &mut Session {
        self.sessions
            .entry(client_id.map(str::to_owned))
            .or_default()
    }

    /// The default (`None`-keyed) session.
    pub fn default_session(&mut self) -> &mut Session {
        self.session_mut(None)
    }

    /// Read-only view of a session, if it exists.
    #[must_use]
    pub fn session(&self, client_id: Option<&str>) -> Option<&Session> {
        self.sessions.get(&client_id.map(str::to_owned))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop a session entirely; the next access recreates it fresh.
    pub fn remove_session(&mut self, client_id: Option<&str>) {
        self.sessions.remove(&client_id.map(str::to_owned));
    }

    /// Persist the whole context. Runs on every mutation: the worker
    /// may die before the next scheduler tick.
    pub fn persist(&self) {
        self.store.save(&self.to_state());
    }

    fn to_state(&self) -> Value {
        let sessions: serde_json::Map<String, Value> = self
            .sessions
            .iter()
            .map(|(key, session)| {
                (
                    key.clone().unwrap_or_else(|| NULL_KEY.to_owned()),
                    session.to_json(),
                )
            })
            .collect();
        json!({
            "connected": self.connected,
            "debuggerAttached": self.debugger_attached,
            "currentDebuggerTabId": self.current_debugger_tab,
            "sessions": sessions,
        })
    }

    fn rehydrate(&mut self, state: &Value) {
        self.connected = state
            .get("connected")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.debugger_attached = state
            .get("debuggerAttached")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.current_debugger_tab = state.get("currentDebuggerTabId").and_then(Value::as_i64);
        let Some(sessions) = state.get("sessions").and_then(Value::as_object) else {
            return;
        };
        for (key, value) in sessions {
            let client_id = if key == NULL_KEY {
                None
            } else {
                Some(key.clone())
            };
            self.sessions.insert(client_id, Session::from_json(value));
        }
        if self.sessions.is_empty() && !sessions.is_empty() {
            warn!("persisted session state could not be rehydrated");
        }
    }
}
