//! Connection lifecycle: the passive/active/connected state machine,
//! the connection-control tools, and response shaping for both framed
//! (MCP) and raw (script-mode) callers.

use std::sync::{Arc, Mutex, Weak};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::error::BrokerError;
use crate::experiments;
use crate::tools::{ToolDispatcher, ToolReply, ToolSpec};
use crate::transport::{Handshake, TabRecord, TransportEvent, TransportHandle, start_transport};

/// Broker connection state. Singleton per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle; no listener.
    Passive,
    /// Listening; no extension peer yet (or peer lost).
    Active,
    /// An extension completed the handshake.
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passive => "passive",
            Self::Active => "active",
            Self::Connected => "connected",
        }
    }
}

/// Peer metadata recorded from the handshake frame.
#[derive(Debug, Clone)]
pub struct BrowserInfo {
    pub name: String,
    pub version: String,
    pub build_timestamp: Option<String>,
}

/// Events pushed to the stdio frontend outside request/response flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendEvent {
    /// The advertised tool list changed (enable/disable).
    ToolListChanged,
}

#[derive(Default)]
struct Inner {
    state: Option<ConnectionState>,
    client_id: Option<String>,
    transport: Option<TransportHandle>,
    dispatcher: Option<Arc<ToolDispatcher>>,
    attached_tab: Option<TabRecord>,
    browser: Option<BrowserInfo>,
    obfuscated_css: bool,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.state.unwrap_or(ConnectionState::Passive)
    }
}

/// Owns the state machine, the active transport, and the dispatcher.
pub struct ConnectionManager {
    config: Config,
    inner: Mutex<Inner>,
    notifier: Mutex<Option<mpsc::UnboundedSender<FrontendEvent>>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner::default()),
            notifier: Mutex::new(None),
        })
    }

    /// Register the frontend's notification channel.
    pub fn set_notifier(&self, tx: mpsc::UnboundedSender<FrontendEvent>) {
        *self.notifier.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state()
    }

    #[must_use]
    pub fn attached_tab(&self) -> Option<TabRecord> {
        self.lock_inner().attached_tab.clone()
    }

    /// Record a fresh tab record (tab tool results, tab-info pushes).
    pub fn set_attached_tab(&self, tab: Option<TabRecord>) {
        self.lock_inner().attached_tab = tab;
    }

    /// Styles handlers flip this when they spot hashed CSS filenames.
    pub fn set_css_obfuscation(&self, on: bool) {
        self.lock_inner().obfuscated_css = on;
    }

    #[must_use]
    pub fn transport(&self) -> Option<TransportHandle> {
        self.lock_inner().transport.clone()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify_frontend(&self, event: FrontendEvent) {
        let guard = self
            .notifier
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            // Best-effort; a closed frontend channel is not our problem.
            let _ = tx.send(event);
        }
    }

    // -----------------------------------------------------------------
    // Connection-control tools
    // -----------------------------------------------------------------

    /// `enable`: start listening and prepare the dispatcher.
    ///
    /// # Errors
    ///
    /// `MissingClientId` for an absent/blank id; `PortInUse` or
    /// `BindFailure` when the listener cannot start.
    pub async fn enable(self: &Arc<Self>, client_id: Option<&str>) -> Result<ToolReply, BrokerError> {
        let client_id = client_id.map(str::trim).unwrap_or_default();
        if client_id.is_empty() {
            return Err(BrokerError::MissingClientId);
        }

        if self.state() != ConnectionState::Passive {
            return Ok(ToolReply::json(
                "Connection already enabled.",
                json!({"success": true, "status": "already_enabled"}),
            ));
        }

        // Infra-gating experiments come from the startup allow-list,
        // not the runtime catalog. A multiplexer would hook raw
        // connections here; none is registered in this build.
        let multiplexed =
            experiments::is_infra_enabled("multiplexer", &self.config.enabled_experiments);
        if multiplexed {
            debug!("multiplexer allow-listed but no handler is registered");
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = start_transport(
            &self.config.host,
            self.config.port,
            self.config.debug,
            events_tx,
            None,
        )
        .await
        .map_err(BrokerError::from)?;

        let dispatcher = Arc::new(ToolDispatcher::new(
            transport.clone(),
            Arc::downgrade(self),
        ));

        {
            let mut inner = self.lock_inner();
            inner.state = Some(ConnectionState::Active);
            inner.client_id = Some(client_id.to_owned());
            inner.transport = Some(transport.clone());
            inner.dispatcher = Some(dispatcher);
        }

        spawn_event_pump(Arc::downgrade(self), events_rx);
        self.notify_frontend(FrontendEvent::ToolListChanged);
        debug!(port = transport.port(), client_id, "connection enabled");

        Ok(ToolReply::json(
            &format!(
                "Listening on port {}. Waiting for the browser extension to connect.",
                transport.port()
            ),
            json!({
                "success": true,
                "status": "enabled",
                "port": transport.port(),
                "client_id": client_id,
            }),
        ))
    }

    /// `disable`: stop the transport, drop the dispatcher, reset
    /// experiments and derived state.
    pub async fn disable(&self) -> Result<ToolReply, BrokerError> {
        let transport = {
            let mut inner = self.lock_inner();
            if inner.state() == ConnectionState::Passive {
                return Ok(ToolReply::json(
                    "Connection already disabled.",
                    json!({"success": true, "status": "already_disabled"}),
                ));
            }
            inner.state = Some(ConnectionState::Passive);
            inner.client_id = None;
            inner.dispatcher = None;
            inner.attached_tab = None;
            inner.browser = None;
            inner.obfuscated_css = false;
            inner.transport.take()
        };

        if let Some(transport) = transport {
            transport.stop().await;
        }
        experiments::registry().reset();
        self.notify_frontend(FrontendEvent::ToolListChanged);
        debug!("connection disabled");

        Ok(ToolReply::json(
            "Connection disabled.",
            json!({"success": true, "status": "disabled"}),
        ))
    }

    /// `status`: connection state, peer metadata, attached tab,
    /// experiment states.
    #[must_use]
    pub fn status(&self) -> ToolReply {
        let inner = self.lock_inner();
        let experiments: Value = experiments::registry()
            .get_states()
            .into_iter()
            .map(|(name, on)| (name.to_owned(), Value::Bool(on)))
            .collect::<serde_json::Map<_, _>>()
            .into();
        let data = json!({
            "success": true,
            "state": inner.state().as_str(),
            "port": self.config.port,
            "client_id": inner.client_id,
            "browser": inner.browser.as_ref().map(|b| json!({
                "name": b.name,
                "version": b.version,
                "build_timestamp": b.build_timestamp,
            })),
            "attached_tab": inner.attached_tab,
            "experiments": experiments,
        });
        drop(inner);
        ToolReply::json("Connection status.", data)
    }

    /// `experimental_features`: toggle and inspect the experiment
    /// catalog.
    ///
    /// # Errors
    ///
    /// `UnknownAction` / `UnknownExperiment` / `InvalidParams`.
    pub fn experimental_features(&self, args: &Value) -> Result<ToolReply, BrokerError> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("status");
        let registry = experiments::registry();
        match action {
            "enable" | "disable" => {
                let name = args
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BrokerError::InvalidParams("name is required".into()))?;
                if action == "enable" {
                    registry.enable(name)?;
                } else {
                    registry.disable(name)?;
                }
                Ok(ToolReply::json(
                    &format!("Experiment {name} {action}d."),
                    json!({"success": true, "experiment": name, "enabled": action == "enable"}),
                ))
            }
            "list" => Ok(ToolReply::json(
                "Available experiments.",
                json!({"success": true, "available": registry.list_available()}),
            )),
            "status" => {
                let states: Value = registry
                    .get_states()
                    .into_iter()
                    .map(|(name, on)| (name.to_owned(), Value::Bool(on)))
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                Ok(ToolReply::json(
                    "Experiment states.",
                    json!({"success": true, "experiments": states}),
                ))
            }
            other => Err(BrokerError::UnknownAction {
                tool: "experimental_features",
                action: other.to_owned(),
            }),
        }
    }

    /// `reload`: ask the extension to reload itself. Best-effort.
    pub async fn reload(&self) -> Result<ToolReply, BrokerError> {
        let Some(transport) = self.transport() else {
            return Err(BrokerError::NotEnabled);
        };
        transport.send_notification("reload", None).await;
        Ok(ToolReply::json(
            "Reload requested.",
            json!({"success": true, "status": "reload_requested"}),
        ))
    }

    // -----------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------

    /// Call a tool by name and shape the outcome for the caller's mode.
    ///
    /// Never returns an error: failures become shaped error payloads.
    pub async fn call_tool(self: &Arc<Self>, name: &str, args: &Value, raw: bool) -> Value {
        let outcome = self.call_tool_inner(name, args).await;
        match outcome {
            Ok(reply) => {
                if raw {
                    reply.data
                } else {
                    self.frame_reply(&reply)
                }
            }
            Err(err) => {
                debug!(tool = name, error = %err, "tool failed");
                if raw {
                    err.to_raw()
                } else {
                    self.frame_error(&err)
                }
            }
        }
    }

    async fn call_tool_inner(
        self: &Arc<Self>,
        name: &str,
        args: &Value,
    ) -> Result<ToolReply, BrokerError> {
        match name {
            "enable" => {
                self.enable(args.get("client_id").and_then(Value::as_str))
                    .await
            }
            "disable" => self.disable().await,
            "status" => Ok(self.status()),
            "experimental_features" => self.experimental_features(args),
            "reload" => self.reload().await,
            _ => {
                let dispatcher = self.lock_inner().dispatcher.clone();
                match dispatcher {
                    Some(dispatcher) => dispatcher.dispatch(name, args).await,
                    None if ToolDispatcher::knows(name) => Err(BrokerError::NotEnabled),
                    None => Err(BrokerError::UnknownTool(name.to_owned())),
                }
            }
        }
    }

    /// The advertised tool list. Never fails: with no dispatcher only
    /// the connection-control tools are offered.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolSpec> {
        let mut specs = connection_tool_specs();
        if self.lock_inner().dispatcher.is_some() {
            specs.extend(ToolDispatcher::tool_specs());
        }
        specs
    }

    // -----------------------------------------------------------------
    // Response shaping
    // -----------------------------------------------------------------

    fn frame_reply(&self, reply: &ToolReply) -> Value {
        let mut content = vec![json!({
            "type": "text",
            "text": format!("{}{}", self.status_header(), reply.text),
        })];
        if let Some(image) = &reply.image {
            content.push(json!({
                "type": "image",
                "data": image.data,
                "mimeType": image.mime_type,
            }));
        }
        let mut framed = json!({"content": content});
        if reply.is_error {
            framed["isError"] = Value::Bool(true);
        }
        framed
    }

    fn frame_error(&self, err: &BrokerError) -> Value {
        json!({
            "content": [{
                "type": "text",
                "text": format!("{}Error: {err}", self.status_header()),
            }],
            "isError": true,
        })
    }

    /// The one-line status header prefixed to every framed response.
    #[must_use]
    pub fn status_header(&self) -> String {
        let inner = self.lock_inner();
        let version = crate::VERSION;
        let header = match inner.state() {
            ConnectionState::Passive => format!("🔴 v{version} | Disabled"),
            ConnectionState::Active => format!("🟡 v{version} | No extension connected"),
            ConnectionState::Connected => {
                let browser = inner
                    .browser
                    .as_ref()
                    .map_or("unknown", |b| b.name.as_str());
                let mut line = format!("✅ v{version} | {browser}");
                if let Some(tab) = &inner.attached_tab {
                    line.push_str(&format!(
                        " | 📄 Tab {}: {}",
                        tab.index,
                        truncate_url(&tab.url)
                    ));
                    if let Some(stack) = &tab.tech_stack
                        && !stack.is_empty()
                    {
                        line.push_str(&format!(" | 🔧 {}", stack.join(" + ")));
                    }
                    if inner.obfuscated_css {
                        line.push_str(" | ⚠️ Obfuscated CSS");
                    }
                    if tab.stealth {
                        line.push_str(" | 🕵️ Stealth");
                    }
                }
                if self.config.debug.is_enabled()
                    && let Some(ts) = inner
                        .browser
                        .as_ref()
                        .and_then(|b| b.build_timestamp.as_deref())
                    && let Some(clock) = clock_from_timestamp(ts)
                {
                    line.push_str(&format!(" [{clock}]"));
                }
                line
            }
        };
        format!("{header}\n---\n\n")
    }
}

/// URLs longer than 50 characters render as the first 47 plus `...`.
#[must_use]
pub fn truncate_url(url: &str) -> String {
    if url.chars().count() <= 50 {
        url.to_owned()
    } else {
        let head: String = url.chars().take(47).collect();
        format!("{head}...")
    }
}

/// Pull `HH:MM:SS` out of an ISO-8601 build timestamp.
fn clock_from_timestamp(ts: &str) -> Option<String> {
    let time_part = ts.split('T').nth(1)?;
    let clock: String = time_part.chars().take(8).collect();
    if clock.len() == 8 && clock.as_bytes()[2] == b':' && clock.as_bytes()[5] == b':' {
        Some(clock)
    } else {
        None
    }
}

/// Consume transport events and drive the state machine.
fn spawn_event_pump(
    manager: Weak<ConnectionManager>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match event {
                TransportEvent::PeerConnected { replaced } => {
                    let (transport, client_id) = {
                        let mut inner = manager.lock_inner();
                        if replaced {
                            inner.attached_tab = None;
                        }
                        (inner.transport.clone(), inner.client_id.clone())
                    };
                    // Announce the upstream caller to the (re)connected
                    // peer so it can key its session state.
                    if let (Some(transport), Some(client_id)) = (transport, client_id) {
                        transport
                            .send_notification("authenticated", Some(json!({"clientId": client_id})))
                            .await;
                    }
                }
                TransportEvent::Handshake(Handshake {
                    browser,
                    version,
                    build_timestamp,
                }) => {
                    let mut inner = manager.lock_inner();
                    if inner.state() != ConnectionState::Passive {
                        inner.state = Some(ConnectionState::Connected);
                        inner.browser = Some(BrowserInfo {
                            name: browser,
                            version,
                            build_timestamp,
                        });
                    }
                }
                TransportEvent::TabInfo(tab) => {
                    manager.lock_inner().attached_tab = Some(tab);
                }
                TransportEvent::PeerDisconnected => {
                    let mut inner = manager.lock_inner();
                    inner.attached_tab = None;
                    inner.browser = None;
                    if inner.state() == ConnectionState::Connected {
                        inner.state = Some(ConnectionState::Active);
                    }
                }
            }
        }
        debug!("transport event pump finished");
    });
}

/// Specs for the tools the manager itself serves.
#[must_use]
pub fn connection_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "enable",
            description: "Start the broker listener and wait for the browser extension",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "client_id": {"type": "string", "description": "Identifier for this session"},
                },
                "required": ["client_id"],
            }),
        },
        ToolSpec {
            name: "disable",
            description: "Stop the broker listener and disconnect the extension",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "status",
            description: "Connection state, peer metadata, and experiment states",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "experimental_features",
            description: "Enable, disable, or list opt-in experiments",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["enable", "disable", "list", "status"]},
                    "name": {"type": "string"},
                },
            }),
        },
        ToolSpec {
            name: "reload",
            description: "Ask the browser extension to reload itself",
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_url_short_passthrough() {
        assert_eq!(truncate_url("https://example.com"), "https://example.com");
    }

    #[test]
    fn truncate_url_long() {
        let url = format!("https://example.com/{}", "a".repeat(60));
        let out = truncate_url(&url);
        assert_eq!(out.chars().count(), 50);
        assert!(out.ends_with("..."));
        assert!(out.starts_with("https://example.com/"));
    }

    #[test]
    fn truncate_url_exactly_50_unchanged() {
        let url: String = "x".repeat(50);
        assert_eq!(truncate_url(&url), url);
    }

    #[test]
    fn clock_parses_iso() {
        assert_eq!(
            clock_from_timestamp("2026-07-01T12:34:56Z").as_deref(),
            Some("12:34:56")
        );
        assert!(clock_from_timestamp("not-a-timestamp").is_none());
    }

    #[test]
    fn passive_header() {
        let manager = ConnectionManager::new(Config::default());
        let header = manager.status_header();
        assert!(header.starts_with("🔴 v"));
        assert!(header.contains("| Disabled"));
        assert!(header.ends_with("\n---\n\n"));
    }

    #[test]
    fn state_is_passive_initially() {
        let manager = ConnectionManager::new(Config::default());
        assert_eq!(manager.state(), ConnectionState::Passive);
    }

    #[tokio::test]
    async fn enable_without_client_id_fails() {
        let manager = ConnectionManager::new(Config::default());
        let err = manager.enable(None).await.unwrap_err();
        assert!(matches!(err, BrokerError::MissingClientId));
        assert_eq!(manager.state(), ConnectionState::Passive);

        let err = manager.enable(Some("   ")).await.unwrap_err();
        assert!(matches!(err, BrokerError::MissingClientId));
        assert_eq!(manager.state(), ConnectionState::Passive);
    }

    #[tokio::test]
    async fn disable_from_passive_is_noop() {
        let manager = ConnectionManager::new(Config::default());
        let reply = manager.disable().await.unwrap();
        assert_eq!(reply.data["status"], "already_disabled");
        assert_eq!(manager.state(), ConnectionState::Passive);
    }

    #[tokio::test]
    async fn enable_disable_lifecycle() {
        let mut config = Config::default();
        config.port = 0; // ephemeral port for tests
        let manager = ConnectionManager::new(config);

        let reply = manager.enable(Some("proj")).await.unwrap();
        assert_eq!(reply.data["status"], "enabled");
        assert_eq!(manager.state(), ConnectionState::Active);

        // Second enable is a no-op.
        let reply = manager.enable(Some("proj")).await.unwrap();
        assert_eq!(reply.data["status"], "already_enabled");
        assert_eq!(manager.state(), ConnectionState::Active);

        let reply = manager.disable().await.unwrap();
        assert_eq!(reply.data["status"], "disabled");
        assert_eq!(manager.state(), ConnectionState::Passive);
    }

    #[tokio::test]
    async fn list_tools_never_fails() {
        let manager = ConnectionManager::new(Config::default());
        let specs = manager.list_tools();
        // Passive: connection-control tools only.
        assert!(specs.iter().any(|s| s.name == "enable"));
        assert!(!specs.iter().any(|s| s.name == "browser_navigate"));
    }

    #[tokio::test]
    async fn browser_tool_while_passive_reports_not_enabled() {
        let manager = ConnectionManager::new(Config::default());
        let out = manager
            .call_tool("browser_navigate", &json!({"url": "https://example.com"}), true)
            .await;
        assert_eq!(out["success"], false);
        assert_eq!(out["error"], "not_enabled");
    }

    #[tokio::test]
    async fn unknown_tool_reported() {
        let manager = ConnectionManager::new(Config::default());
        let out = manager.call_tool("browser_levitate", &json!({}), true).await;
        assert_eq!(out["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn experiment_toggle_via_tool() {
        let manager = ConnectionManager::new(Config::default());
        let reply = manager
            .experimental_features(&json!({"action": "enable", "name": "page_diffing"}))
            .unwrap();
        assert_eq!(reply.data["success"], true);
        assert!(experiments::registry().is_enabled("page_diffing"));
        experiments::registry().reset();
    }

    #[tokio::test]
    async fn experiment_unknown_name_errors() {
        let manager = ConnectionManager::new(Config::default());
        let err = manager
            .experimental_features(&json!({"action": "enable", "name": "nope"}))
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownExperiment(_)));
    }
}
