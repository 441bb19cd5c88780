//! The extension-side command router: an outbound WebSocket client to
//! the broker with an alarm-driven reconnect loop, a name-to-handler
//! command registry, and the session-aware command implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::humanize;
use crate::secure_eval::wrap_with_page_proxy;
use crate::tools::native_set_value_snippet;

use super::badge::BadgeManager;
use super::host::{AlarmScheduler, BadgeSurface, BrowserHost, SessionStore};
use super::membrane;
use super::session::{CursorPosition, SessionContext};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Alarm names. Reconnection never uses in-process timers: the host
/// may suspend the worker, killing them.
pub const RECONNECT_ALARM: &str = "reconnect";
pub const DRIFT_ALARM: &str = "idle_drift";

/// Reconnect cadence while the broker is away.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Identity announced in the handshake frame.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub broker_port: u16,
    pub browser: String,
    pub version: String,
    pub build_timestamp: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            broker_port: crate::config::DEFAULT_PORT,
            browser: "Chrome".to_owned(),
            version: crate::VERSION.to_owned(),
            build_timestamp: None,
        }
    }
}

type HandlerFuture = BoxFuture<'static, Result<Value, String>>;
type Handler = Arc<dyn Fn(Arc<RouterShared>, Value) -> HandlerFuture + Send + Sync>;

/// State shared between the connection loop and the command handlers.
pub struct RouterShared {
    pub config: RouterConfig,
    pub host: Arc<dyn BrowserHost>,
    pub alarms: Arc<dyn AlarmScheduler>,
    badge: BadgeManager,
    session: Mutex<SessionContext>,
    active_client: Mutex<Option<String>>,
    console_buffer: Mutex<Vec<Value>>,
    network_buffer: Mutex<Vec<Value>>,
    outbound_notifications: Mutex<Vec<Value>>,
}

impl RouterShared {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, SessionContext> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn active_client(&self) -> Option<String> {
        self.active_client
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Run a closure over the active client's session (lazily created)
    /// and persist afterwards.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut super::session::Session) -> T,
    ) -> T {
        let client = self.active_client();
        let mut context = self.lock_session();
        let result = f(context.session_mut(client.as_deref()));
        context.persist();
        result
    }

    /// The tab CDP commands operate on.
    fn attached_tab(&self) -> Result<i64, String> {
        let client = self.active_client();
        let mut context = self.lock_session();
        context
            .session_mut(client.as_deref())
            .attached_tab_id
            .ok_or_else(|| "No tab is attached. Attach a tab first.".to_owned())
    }

    fn sync_badge(&self) {
        let client = self.active_client();
        let mut context = self.lock_session();
        let session = context.session_mut(client.as_deref()).clone();
        drop(context);
        self.badge.sync(&session);
    }

    /// Queue a broker-bound notification; the connection loop flushes
    /// after the current command.
    pub fn queue_notification(&self, method: &str, params: Value) {
        self.outbound_notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(json!({"jsonrpc": "2.0", "method": method, "params": params}));
    }

    fn drain_notifications(&self) -> Vec<Value> {
        std::mem::take(
            &mut *self
                .outbound_notifications
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Host hook: a tab was removed. Clears the attachment when it was
    /// ours and keeps the toolbar indicator in sync.
    pub fn notify_tab_removed(&self, tab_id: i64) {
        let client = self.active_client();
        let mut context = self.lock_session();
        let (snapshot, was_attached) = {
            let session = context.session_mut(client.as_deref());
            let snapshot = session.clone();
            let was_attached = session.attached_tab_id == Some(tab_id);
            if was_attached {
                session.attached_tab_id = None;
            }
            (snapshot, was_attached)
        };
        if was_attached {
            context.debugger_attached = false;
            context.current_debugger_tab = None;
        }
        context.persist();
        drop(context);
        self.badge.on_tab_removed(&snapshot, tab_id);
    }

    /// Host hook: tab activation changed; refresh the indicator.
    pub fn notify_tab_activated(&self, _tab_id: i64) {
        self.sync_badge();
    }

    /// Feed a captured console event (called by the embedding host as
    /// CDP console events arrive).
    pub fn push_console_event(&self, event: Value) {
        self.console_buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }

    /// Feed or update a captured network request, upserting by
    /// `requestId` so the response phase merges into the request entry.
    pub fn push_network_event(&self, event: Value) {
        let mut buffer = self
            .network_buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let request_id = event.get("requestId").and_then(Value::as_str);
        if let Some(request_id) = request_id
            && let Some(existing) = buffer.iter_mut().find(|e| {
                e.get("requestId").and_then(Value::as_str) == Some(request_id)
            })
        {
            if let (Some(target), Some(source)) = (existing.as_object_mut(), event.as_object()) {
                for (key, value) in source {
                    target.insert(key.clone(), value.clone());
                }
            }
            return;
        }
        buffer.push(event);
    }
}

/// The router: owns the handler registry and the reconnect loop.
pub struct ExtensionRouter {
    shared: Arc<RouterShared>,
    handlers: HashMap<String, Handler>,
    alarm_rx: mpsc::UnboundedReceiver<String>,
    reconnect_scheduled: bool,
}

impl ExtensionRouter {
    #[must_use]
    pub fn new(
        config: RouterConfig,
        host: Arc<dyn BrowserHost>,
        alarms: Arc<dyn AlarmScheduler>,
        store: Arc<dyn SessionStore>,
        badge_surface: Arc<dyn BadgeSurface>,
        alarm_rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let shared = Arc::new(RouterShared {
            config,
            host,
            alarms,
            badge: BadgeManager::new(badge_surface),
            session: Mutex::new(SessionContext::new(store)),
            active_client: Mutex::new(None),
            console_buffer: Mutex::new(Vec::new()),
            network_buffer: Mutex::new(Vec::new()),
            outbound_notifications: Mutex::new(Vec::new()),
        });
        let mut router = Self {
            shared,
            handlers: HashMap::new(),
            alarm_rx,
            reconnect_scheduled: false,
        };
        router.register_defaults();
        router
    }

    #[must_use]
    pub fn shared(&self) -> Arc<RouterShared> {
        Arc::clone(&self.shared)
    }

    /// Register a command handler. Re-registering a name silently
    /// replaces the prior handler.
    pub fn register(&mut self, name: &str, handler: Handler) {
        self.handlers.insert(name.to_owned(), handler);
    }

    fn register_fn<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Arc<RouterShared>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |shared, params| Box::pin(f(shared, params)));
        self.handlers.insert(name.to_owned(), handler);
    }

    fn register_defaults(&mut self) {
        self.register_fn("cdp", handlers::cdp);
        self.register_fn("tabs", handlers::tabs);
        self.register_fn("evaluate", handlers::evaluate);
        self.register_fn("validateEval", handlers::validate_eval);
        self.register_fn("capturePageState", handlers::capture_page_state);
        self.register_fn("waitForReady", handlers::wait_for_ready);
        self.register_fn("humanizedMouseMove", handlers::humanized_mouse_move);
        self.register_fn("resizeImage", handlers::resize_image);
        self.register_fn("secureFill", handlers::secure_fill);
        self.register_fn("consoleMessages", handlers::console_messages);
        self.register_fn("networkRequests", handlers::network_requests);
        self.register_fn("listExtensions", handlers::list_extensions);
    }

    /// Run forever: connect, serve, and on loss schedule a single
    /// reconnect alarm and wait for it.
    pub async fn run(mut self) {
        loop {
            match self.connect_and_serve().await {
                Ok(()) => debug!("broker connection closed"),
                Err(e) => debug!(error = %e, "broker connection failed"),
            }
            if !self.reconnect_scheduled {
                self.reconnect_scheduled = true;
                self.shared
                    .alarms
                    .schedule(RECONNECT_ALARM, RECONNECT_DELAY);
            }
            loop {
                let Some(alarm) = self.alarm_rx.recv().await else {
                    return;
                };
                match alarm.as_str() {
                    RECONNECT_ALARM => {
                        self.reconnect_scheduled = false;
                        break;
                    }
                    DRIFT_ALARM => {
                        // Drift only matters while connected; drop it.
                    }
                    other => debug!(alarm = other, "unknown alarm"),
                }
            }
        }
    }

    /// Dial the broker and serve one connection until it closes.
    ///
    /// # Errors
    ///
    /// The connect error when the broker is unreachable.
    pub async fn connect_and_serve(&mut self) -> Result<(), String> {
        let url = format!(
            "ws://127.0.0.1:{}/extension",
            self.shared.config.broker_port
        );
        let (mut ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| e.to_string())?;

        // Announce ourselves before anything else.
        let handshake = json!({
            "type": "handshake",
            "browser": self.shared.config.browser,
            "version": self.shared.config.version,
            "buildTimestamp": self.shared.config.build_timestamp,
        });
        ws.send(Message::Text(handshake.to_string().into()))
            .await
            .map_err(|e| e.to_string())?;

        {
            let mut context = self.shared.lock_session();
            context.connected = true;
            context.persist();
        }
        self.shared.sync_badge();
        debug!(url, "connected to broker");

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&mut ws, &text).await;
                            self.flush_notifications(&mut ws).await;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                alarm = self.alarm_rx.recv() => {
                    match alarm.as_deref() {
                        Some(DRIFT_ALARM) => handlers::idle_drift_tick(&self.shared).await,
                        Some(RECONNECT_ALARM) => {
                            // Already connected; stale alarm.
                            self.reconnect_scheduled = false;
                        }
                        Some(_) | None => {}
                    }
                }
            }
        }

        {
            let mut context = self.shared.lock_session();
            context.connected = false;
            context.persist();
        }
        self.shared.sync_badge();
        Ok(())
    }

    async fn handle_frame(&mut self, ws: &mut WsStream, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping unparsable frame from broker");
                return;
            }
        };

        let id = frame.get("id").cloned();
        let method = frame.get("method").and_then(Value::as_str);

        match (id, method) {
            (Some(id), Some(method)) => {
                let params = frame.get("params").cloned().unwrap_or(Value::Null);
                let response = self.dispatch(method, params).await;
                let envelope = match response {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err(message) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"message": message},
                    }),
                };
                if let Err(e) = ws.send(Message::Text(envelope.to_string().into())).await {
                    warn!(error = %e, "failed to send response");
                }
            }
            (None, Some(method)) => self.handle_notification(method, &frame).await,
            _ => {
                if frame.get("error").is_some() {
                    debug!("error-only frame from broker: {frame}");
                } else {
                    debug!("unclassifiable frame from broker");
                }
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, String> {
        let Some(handler) = self.handlers.get(method).cloned() else {
            return Err(format!("unknown method: {method}"));
        };
        handler(Arc::clone(&self.shared), params).await
    }

    async fn handle_notification(&mut self, method: &str, frame: &Value) {
        match method {
            "authenticated" => {
                let client_id = frame
                    .pointer("/params/clientId")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                debug!(?client_id, "authenticated");
                *self
                    .shared
                    .active_client
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = client_id.clone();
                let drift_enabled = {
                    let mut context = self.shared.lock_session();
                    let session = context.session_mut(client_id.as_deref());
                    let enabled = session.humanization.enabled;
                    context.persist();
                    enabled
                };
                if drift_enabled {
                    self.shared.alarms.schedule(
                        DRIFT_ALARM,
                        humanize::drift_interval(&mut rand::thread_rng()),
                    );
                }
            }
            "reload" => {
                debug!("reload requested by broker");
                self.shared.host.reload_runtime();
            }
            other => debug!(method = other, "unknown notification from broker"),
        }
    }

    async fn flush_notifications(&self, ws: &mut WsStream) {
        for notification in self.shared.drain_notifications() {
            if let Err(e) = ws
                .send(Message::Text(notification.to_string().into()))
                .await
            {
                warn!(error = %e, "failed to send notification");
                return;
            }
        }
    }
}

// ===========================================================================
// Command handlers
// ===========================================================================

mod handlers {
    use super::*;

    pub async fn cdp(shared: Arc<RouterShared>, params: Value) -> Result<Value, String> {
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .ok_or("cdp requires a method")?;
        let cdp_params = params.get("params").cloned().unwrap_or_else(|| json!({}));
        let tab = shared.attached_tab()?;
        shared.host.send_cdp(tab, method, cdp_params).await
    }

    pub async fn tabs(shared: Arc<RouterShared>, params: Value) -> Result<Value, String> {
        let action = params
            .get("action")
            .and_then(Value::as_str)
            .ok_or("tabs requires an action")?;
        match action {
            "list" => {
                let tabs = shared.host.list_tabs().await?;
                let records: Vec<Value> = tabs.iter().map(super::super::host::HostTab::to_record).collect();
                Ok(json!({"tabs": records}))
            }
            "new" => {
                let url = params.get("url").and_then(Value::as_str);
                let tab = shared.host.create_tab(url).await?;
                attach_to(&shared, tab.id).await?;
                let record = tab.to_record();
                shared.queue_notification(
                    "notifications/tab_info_update",
                    json!({"tab": record}),
                );
                Ok(json!({"tab": record, "currentTab": record}))
            }
            "attach" => {
                let tab_id = params
                    .get("tabId")
                    .and_then(Value::as_i64)
                    .ok_or("attach requires tabId")?;
                attach_to(&shared, tab_id).await?;
                shared.host.activate_tab(tab_id).await.ok();
                let record = find_tab_record(&shared, tab_id).await;
                shared.queue_notification(
                    "notifications/tab_info_update",
                    json!({"tab": record}),
                );
                Ok(json!({"tab": record, "currentTab": record}))
            }
            "close" => {
                let attached = shared.with_session(|s| s.attached_tab_id);
                let target = params
                    .get("tabId")
                    .and_then(Value::as_i64)
                    .or(attached)
                    .ok_or("no tab to close")?;
                let closing_attached = attached == Some(target);
                if closing_attached {
                    let _ = shared.host.detach_debugger(target).await;
                    let mut context = shared.lock_session();
                    context.debugger_attached = false;
                    context.current_debugger_tab = None;
                    drop(context);
                    shared.with_session(|s| s.attached_tab_id = None);
                    shared.sync_badge();
                }
                shared.host.close_tab(target).await?;
                Ok(json!({"closed": target, "closedAttached": closing_attached}))
            }
            other => Err(format!("tabs: unknown action: {other}")),
        }
    }

    /// Debugger policy: one attached tab per browser. Switching tabs
    /// detaches the previous one first; attach errors travel verbatim
    /// so the broker can classify conflicts.
    async fn attach_to(shared: &Arc<RouterShared>, tab_id: i64) -> Result<(), String> {
        let previous = {
            let context = shared.lock_session();
            context.current_debugger_tab
        };
        if let Some(previous_tab) = previous
            && previous_tab != tab_id
        {
            let _ = shared.host.detach_debugger(previous_tab).await;
        }
        shared.host.attach_debugger(tab_id).await?;
        {
            let mut context = shared.lock_session();
            context.debugger_attached = true;
            context.current_debugger_tab = Some(tab_id);
            drop(context);
        }
        shared.with_session(|s| s.attached_tab_id = Some(tab_id));
        shared.sync_badge();
        Ok(())
    }

    async fn find_tab_record(shared: &Arc<RouterShared>, tab_id: i64) -> Value {
        match shared.host.list_tabs().await {
            Ok(tabs) => tabs
                .iter()
                .find(|t| t.id == tab_id)
                .map_or(json!({"tabId": tab_id, "index": 0}), |t| t.to_record()),
            Err(_) => json!({"tabId": tab_id, "index": 0}),
        }
    }

    pub async fn evaluate(shared: Arc<RouterShared>, params: Value) -> Result<Value, String> {
        let code = params
            .get("code")
            .and_then(Value::as_str)
            .ok_or("evaluate requires code")?;
        let await_promise = params
            .get("awaitPromise")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let prewrapped = params
            .get("prewrapped")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let secure = params
            .get("secure")
            .and_then(Value::as_bool)
            .unwrap_or(prewrapped);

        let expression = if secure && !prewrapped {
            wrap_with_page_proxy(code)
        } else {
            code.to_owned()
        };

        let tab = shared.attached_tab()?;
        let result = shared
            .host
            .send_cdp(
                tab,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "userGesture": true,
                    "awaitPromise": await_promise,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let message = details
                .pointer("/exception/description")
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("evaluation failed");
            return Err(message.to_owned());
        }
        Ok(json!({"value": result.pointer("/result/value").cloned().unwrap_or(Value::Null)}))
    }

    pub async fn validate_eval(_shared: Arc<RouterShared>, params: Value) -> Result<Value, String> {
        let code = params
            .get("code")
            .and_then(Value::as_str)
            .ok_or("validateEval requires code")?;
        match membrane::validate(code) {
            Ok(()) => Ok(json!({"safe": true})),
            Err(reason) => Ok(json!({"safe": false, "reason": reason})),
        }
    }

    const CAPTURE_STATE_JS: &str = r"(function() {
  var all = document.querySelectorAll('*');
  var text = [];
  var hidden = 0, shadow = 0, iframes = 0, visibleCount = 0;
  for (var i = 0; i < all.length; i++) {
    var el = all[i];
    if (el.shadowRoot) { shadow++; }
    if (el.tagName === 'IFRAME') { iframes++; }
    var style = window.getComputedStyle(el);
    var invisible = style.display === 'none' || style.visibility === 'hidden';
    if (invisible) { hidden++; continue; }
    visibleCount++;
    var direct = '';
    for (var c = el.firstChild; c; c = c.nextSibling) {
      if (c.nodeType === 3) { direct += c.textContent; }
    }
    direct = direct.trim();
    if (direct && text.length < 400) { text.push(direct.slice(0, 200)); }
  }
  return {
    elementCount: visibleCount,
    textContent: text,
    shadowRootCount: shadow,
    iframeCount: iframes,
    hiddenElementCount: hidden,
    pageElementCount: all.length,
  };
})()";

    pub async fn capture_page_state(
        shared: Arc<RouterShared>,
        _params: Value,
    ) -> Result<Value, String> {
        let tab = shared.attached_tab()?;
        let result = shared
            .host
            .send_cdp(
                tab,
                "Runtime.evaluate",
                json!({"expression": CAPTURE_STATE_JS, "returnByValue": true}),
            )
            .await?;
        Ok(result.pointer("/result/value").cloned().unwrap_or_else(|| json!({})))
    }

    /// Readiness probe: document readyState plus DOM stability (two
    /// consecutive samples with an unchanged element count).
    pub async fn wait_for_ready(shared: Arc<RouterShared>, params: Value) -> Result<Value, String> {
        let timeout_ms = params
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .unwrap_or(5000);
        let tab = shared.attached_tab()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let probe = r"({state: document.readyState, count: document.querySelectorAll('*').length})";

        let mut previous_count: Option<i64> = None;
        while Instant::now() < deadline {
            let sample = shared
                .host
                .send_cdp(
                    tab,
                    "Runtime.evaluate",
                    json!({"expression": probe, "returnByValue": true}),
                )
                .await?;
            let value = sample.pointer("/result/value").cloned().unwrap_or_else(|| json!({}));
            let state = value.get("state").and_then(Value::as_str).unwrap_or("");
            let count = value.get("count").and_then(Value::as_i64).unwrap_or(-1);
            if state == "complete" && previous_count == Some(count) {
                return Ok(json!({"ready": true}));
            }
            previous_count = Some(count);
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Ok(json!({"ready": false, "timedOut": true}))
    }

    pub async fn humanized_mouse_move(
        shared: Arc<RouterShared>,
        params: Value,
    ) -> Result<Value, String> {
        let waypoints = params
            .get("waypoints")
            .and_then(Value::as_array)
            .ok_or("humanizedMouseMove requires waypoints")?
            .clone();
        let tab = match params.get("tabId").and_then(Value::as_i64) {
            Some(tab) if tab > 0 => tab,
            _ => shared.attached_tab()?,
        };

        let mut last: Option<(f64, f64)> = None;
        for waypoint in &waypoints {
            let x = waypoint.get("x").and_then(Value::as_f64).unwrap_or(0.0);
            let y = waypoint.get("y").and_then(Value::as_f64).unwrap_or(0.0);
            let delay = waypoint
                .get("delayMs")
                .and_then(Value::as_u64)
                .unwrap_or(16);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            shared
                .host
                .send_cdp(
                    tab,
                    "Input.dispatchMouseEvent",
                    json!({"type": "mouseMoved", "x": x, "y": y}),
                )
                .await?;
            last = Some((x, y));
        }

        if let Some((x, y)) = last {
            shared.with_session(|s| {
                s.cursor_positions.insert(tab, CursorPosition { x, y });
            });
        }
        Ok(json!({"moved": waypoints.len()}))
    }

    /// One idle-drift tick: nudge the cursor a few pixels and
    /// re-schedule.
    pub async fn idle_drift_tick(shared: &Arc<RouterShared>) {
        let (enabled, tab, position) = {
            let client = shared.active_client();
            let mut context = shared.lock_session();
            let session = context.session_mut(client.as_deref());
            let tab = session.attached_tab_id;
            let position = tab
                .and_then(|t| session.cursor_positions.get(&t).copied())
                .unwrap_or(CursorPosition { x: 0.0, y: 0.0 });
            (session.humanization.enabled, tab, position)
        };
        let Some(tab) = tab else {
            return;
        };
        if !enabled {
            return;
        }

        let (dx, dy) = humanize::drift_offset(&mut rand::thread_rng());
        let x = (position.x + dx).max(0.0);
        let y = (position.y + dy).max(0.0);
        let _ = shared
            .host
            .send_cdp(
                tab,
                "Input.dispatchMouseEvent",
                json!({"type": "mouseMoved", "x": x, "y": y}),
            )
            .await;
        shared.with_session(|s| {
            s.cursor_positions.insert(tab, CursorPosition { x, y });
        });
        shared
            .alarms
            .schedule(DRIFT_ALARM, humanize::drift_interval(&mut rand::thread_rng()));
    }

    pub async fn resize_image(shared: Arc<RouterShared>, params: Value) -> Result<Value, String> {
        let data = params
            .get("data")
            .and_then(Value::as_str)
            .ok_or("resizeImage requires data")?;
        let mime_type = params
            .get("mimeType")
            .and_then(Value::as_str)
            .unwrap_or("image/jpeg");
        let max_dimension = params
            .get("maxDimension")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(2000);
        let resized = shared
            .host
            .resize_image(data.to_owned(), mime_type, max_dimension)
            .await?;
        Ok(json!({"data": resized}))
    }

    /// Fill a field with a secret. The value is used once and never
    /// reflected into the response, the logs, or any buffer.
    pub async fn secure_fill(shared: Arc<RouterShared>, params: Value) -> Result<Value, String> {
        let selector = params
            .get("selector")
            .and_then(Value::as_str)
            .ok_or("secureFill requires selector")?;
        let value = params
            .get("value")
            .and_then(Value::as_str)
            .ok_or("secureFill requires value")?;
        let tab = shared.attached_tab()?;
        let snippet = native_set_value_snippet(selector, value, false);
        let result = shared
            .host
            .send_cdp(
                tab,
                "Runtime.evaluate",
                json!({"expression": snippet, "returnByValue": true}),
            )
            .await?;
        let ok = result
            .pointer("/result/value/ok")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if ok {
            Ok(json!({"filled": true, "selector": selector}))
        } else {
            Err(format!("no element matches selector: {selector}"))
        }
    }

    pub async fn console_messages(
        shared: Arc<RouterShared>,
        params: Value,
    ) -> Result<Value, String> {
        let action = params.get("action").and_then(Value::as_str).unwrap_or("list");
        let mut buffer = shared
            .console_buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if action == "clear" {
            buffer.clear();
            return Ok(json!({"cleared": true}));
        }

        let level = params.get("level").and_then(Value::as_str);
        let filter = params.get("filter").and_then(Value::as_str);
        let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;

        let matching: Vec<&Value> = buffer
            .iter()
            .filter(|m| {
                level.is_none_or(|l| m.get("level").and_then(Value::as_str) == Some(l))
                    && filter.is_none_or(|f| {
                        m.get("text")
                            .and_then(Value::as_str)
                            .is_some_and(|t| t.contains(f))
                    })
            })
            .collect();
        let total = matching.len();
        let page: Vec<Value> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(json!({"messages": page, "total": total}))
    }

    pub async fn network_requests(
        shared: Arc<RouterShared>,
        params: Value,
    ) -> Result<Value, String> {
        let action = params.get("action").and_then(Value::as_str).unwrap_or("list");
        let mut buffer = shared
            .network_buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match action {
            "clear" => {
                buffer.clear();
                Ok(json!({"cleared": true}))
            }
            "details" => {
                let request_id = params
                    .get("requestId")
                    .and_then(Value::as_str)
                    .ok_or("details requires requestId")?;
                let entry = buffer
                    .iter()
                    .find(|e| e.get("requestId").and_then(Value::as_str) == Some(request_id))
                    .cloned()
                    .ok_or_else(|| format!("request {request_id} not found"))?;
                Ok(json!({"request": entry}))
            }
            _ => {
                let filter = params.get("filter").and_then(Value::as_str);
                let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
                let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(30) as usize;
                let matching: Vec<&Value> = buffer
                    .iter()
                    .filter(|e| {
                        filter.is_none_or(|f| {
                            e.get("url")
                                .and_then(Value::as_str)
                                .is_some_and(|u| u.contains(f))
                        })
                    })
                    .collect();
                let total = matching.len();
                let page: Vec<Value> = matching
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect();
                Ok(json!({"requests": page, "total": total}))
            }
        }
    }

    pub async fn list_extensions(
        shared: Arc<RouterShared>,
        _params: Value,
    ) -> Result<Value, String> {
        let extensions = shared.host.list_extensions().await?;
        Ok(json!({"extensions": extensions}))
    }
}
