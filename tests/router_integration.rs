//! Full-stack tests: the broker (manager + listener) on one side, the
//! real extension router on the other, talking over actual sockets,
//! with a scripted browser host standing in for the tab.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use supersurf::config::Config;
use supersurf::experiments;
use supersurf::extension::{
    AlarmScheduler, BrowserHost, ExtensionRouter, HostTab, InMemorySessionStore, LogBadge,
    ManualAlarms, RouterConfig,
};
use supersurf::manager::{ConnectionManager, ConnectionState};

// ===========================================================================
// Scripted browser host
// ===========================================================================

/// Records every CDP call and answers `Runtime.evaluate` from a queue
/// of substring-keyed canned values.
#[derive(Default)]
struct FakeHost {
    tabs: Mutex<Vec<HostTab>>,
    next_tab_id: AtomicI64,
    cdp_log: Mutex<Vec<(i64, String, Value)>>,
    attached: Mutex<Vec<i64>>,
    eval_scripts: Mutex<Vec<(String, Value)>>,
}

impl FakeHost {
    fn new() -> Arc<Self> {
        let host = Self {
            next_tab_id: AtomicI64::new(1),
            ..Self::default()
        };
        host.tabs.lock().unwrap().push(HostTab {
            id: 1,
            index: 0,
            title: "Seed".into(),
            url: "https://example.com".into(),
        });
        host.next_tab_id.store(2, Ordering::Relaxed);
        Arc::new(host)
    }

    /// Queue a canned value for the next `Runtime.evaluate` whose
    /// expression contains `needle`.
    fn script_eval(&self, needle: &str, value: Value) {
        self.eval_scripts
            .lock()
            .unwrap()
            .push((needle.to_owned(), value));
    }

    fn cdp_calls(&self, method: &str) -> Vec<Value> {
        self.cdp_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m, _)| m == method)
            .map(|(_, _, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl BrowserHost for FakeHost {
    async fn list_tabs(&self) -> Result<Vec<HostTab>, String> {
        Ok(self.tabs.lock().unwrap().clone())
    }

    async fn create_tab(&self, url: Option<&str>) -> Result<HostTab, String> {
        let id = self.next_tab_id.fetch_add(1, Ordering::Relaxed);
        let tab = HostTab {
            id,
            index: id - 1,
            title: String::new(),
            url: url.unwrap_or("about:blank").to_owned(),
        };
        self.tabs.lock().unwrap().push(tab.clone());
        Ok(tab)
    }

    async fn close_tab(&self, tab_id: i64) -> Result<(), String> {
        self.tabs.lock().unwrap().retain(|t| t.id != tab_id);
        Ok(())
    }

    async fn activate_tab(&self, _tab_id: i64) -> Result<(), String> {
        Ok(())
    }

    async fn attach_debugger(&self, tab_id: i64) -> Result<(), String> {
        self.attached.lock().unwrap().push(tab_id);
        Ok(())
    }

    async fn detach_debugger(&self, _tab_id: i64) -> Result<(), String> {
        Ok(())
    }

    async fn send_cdp(&self, tab_id: i64, method: &str, params: Value) -> Result<Value, String> {
        self.cdp_log
            .lock()
            .unwrap()
            .push((tab_id, method.to_owned(), params.clone()));
        if method == "Runtime.evaluate" {
            let expression = params
                .get("expression")
                .and_then(Value::as_str)
                .unwrap_or("");
            let mut scripts = self.eval_scripts.lock().unwrap();
            if let Some(pos) = scripts
                .iter()
                .position(|(needle, _)| expression.contains(needle.as_str()))
            {
                let (_, value) = scripts.remove(pos);
                return Ok(json!({"result": {"value": value}}));
            }
            return Ok(json!({"result": {"value": null}}));
        }
        Ok(json!({}))
    }
}

// ===========================================================================
// Harness
// ===========================================================================

/// The experiment registry is process-global; tests in this binary
/// that touch it must not interleave.
static EXPERIMENT_LOCK: Mutex<()> = Mutex::new(());

struct Stack {
    manager: Arc<ConnectionManager>,
    host: Arc<FakeHost>,
    alarms: Arc<ManualAlarms>,
    router_task: tokio::task::JoinHandle<()>,
    _serial: std::sync::MutexGuard<'static, ()>,
}

async fn start_stack() -> Stack {
    let serial = EXPERIMENT_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    experiments::registry().reset();
    let manager = ConnectionManager::new(Config {
        port: 0,
        ..Config::default()
    });
    manager.enable(Some("proj")).await.unwrap();
    let port = manager.transport().unwrap().port();

    let host = FakeHost::new();
    let (alarms, alarm_rx) = ManualAlarms::pair();
    let alarms = Arc::new(alarms);
    let mut router = ExtensionRouter::new(
        RouterConfig {
            broker_port: port,
            browser: "Chrome".into(),
            version: "2.1.0".into(),
            build_timestamp: None,
        },
        Arc::clone(&host) as Arc<dyn BrowserHost>,
        Arc::clone(&alarms) as Arc<dyn supersurf::extension::AlarmScheduler>,
        Arc::new(InMemorySessionStore::default()),
        Arc::new(LogBadge),
        alarm_rx,
    );
    let router_task = tokio::spawn(async move {
        let _ = router.connect_and_serve().await;
    });

    for _ in 0..100 {
        if manager.state() == ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.state(), ConnectionState::Connected);
    // Let the authenticated notification land before the first command.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Stack {
        manager,
        host,
        alarms,
        router_task,
        _serial: serial,
    }
}

impl Stack {
    async fn teardown(self) {
        self.manager.disable().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.router_task).await;
        experiments::registry().reset();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn tabs_new_attaches_debugger_and_updates_broker() {
    let stack = start_stack().await;

    let result = stack
        .manager
        .call_tool(
            "browser_tabs",
            &json!({"action": "new", "url": "https://docs.rs"}),
            true,
        )
        .await;
    assert_eq!(result["success"], true, "{result}");
    let tab_id = result["tab"]["tabId"].as_i64().unwrap();
    assert_eq!(stack.host.attached.lock().unwrap().as_slice(), &[tab_id]);

    // The response's currentTab side-channel updated the manager.
    for _ in 0..50 {
        if stack.manager.attached_tab().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stack.manager.attached_tab().unwrap().tab_id, tab_id);

    stack.teardown().await;
}

#[tokio::test]
async fn evaluate_round_trips_through_cdp() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;

    stack.host.script_eval("1 + 1", json!(2));
    let result = stack
        .manager
        .call_tool("browser_evaluate", &json!({"expression": "1 + 1"}), true)
        .await;
    assert_eq!(result["success"], true, "{result}");
    assert_eq!(result["result"], 2);

    stack.teardown().await;
}

#[tokio::test]
async fn secure_eval_layer1_blocks_before_any_send() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;
    stack.host.cdp_log.lock().unwrap().clear();

    experiments::registry().enable("secure_eval").unwrap();
    let result = stack
        .manager
        .call_tool(
            "browser_evaluate",
            &json!({"expression": "fetch('/api')"}),
            false,
        )
        .await;

    assert_eq!(result["isError"], true, "{result}");
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("blocked API"), "text: {text}");
    assert!(text.contains("fetch"), "text: {text}");
    // Nothing reached the browser.
    assert!(stack.host.cdp_calls("Runtime.evaluate").is_empty());

    stack.teardown().await;
}

#[tokio::test]
async fn secure_eval_layer2_membrane_blocks() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;

    experiments::registry().enable("secure_eval").unwrap();
    // Passes the static screen, but the chain terminal is a membrane
    // blocked name.
    let result = stack
        .manager
        .call_tool(
            "browser_evaluate",
            &json!({"expression": "Object.getPrototypeOf(x)"}),
            false,
        )
        .await;

    assert_eq!(result["isError"], true, "{result}");
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("membrane"), "text: {text}");

    stack.teardown().await;
}

#[tokio::test]
async fn secure_eval_allows_safe_code_wrapped() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;

    experiments::registry().enable("secure_eval").unwrap();
    stack
        .host
        .script_eval("document.title", json!("Example Domain"));
    let result = stack
        .manager
        .call_tool(
            "browser_evaluate",
            &json!({"expression": "document.title"}),
            true,
        )
        .await;
    assert_eq!(result["success"], true, "{result}");
    assert_eq!(result["result"], "Example Domain");

    // The expression that reached the page was the proxy wrapper, with
    // the original inside.
    let evals = stack.host.cdp_calls("Runtime.evaluate");
    let wrapped = evals
        .iter()
        .filter_map(|p| p.get("expression").and_then(Value::as_str))
        .find(|e| e.contains("with (__proxy)"))
        .expect("expected a wrapped evaluation");
    assert!(wrapped.contains("document.title"));

    stack.teardown().await;
}

#[tokio::test]
async fn humanized_click_moves_through_waypoints() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;
    stack.host.cdp_log.lock().unwrap().clear();

    experiments::registry()
        .enable("mouse_humanization")
        .unwrap();

    // Selector resolution and viewport probing are page evals.
    stack
        .host
        .script_eval("getBoundingClientRect", json!({"x": 500.0, "y": 300.0}));
    stack
        .host
        .script_eval("innerWidth", json!({"w": 1920.0, "h": 1080.0}));

    let result = stack
        .manager
        .call_tool(
            "browser_interact",
            &json!({"actions": [{"type": "click", "selector": "#cta"}]}),
            true,
        )
        .await;
    assert_eq!(result["success"], true, "{result}");

    // The router replayed a multi-waypoint path ending at the target.
    let moves = stack.host.cdp_calls("Input.dispatchMouseEvent");
    let moved: Vec<&Value> = moves
        .iter()
        .filter(|p| p["type"] == "mouseMoved")
        .collect();
    assert!(moved.len() >= 2, "expected a waypoint path, got {moved:?}");
    let last_move = moved.last().unwrap();
    assert_eq!(last_move["x"].as_f64().unwrap().round() as i64, 500);
    assert_eq!(last_move["y"].as_f64().unwrap().round() as i64, 300);

    // Press and release landed on the target.
    let pressed: Vec<&Value> = moves
        .iter()
        .filter(|p| p["type"] == "mousePressed")
        .collect();
    let released: Vec<&Value> = moves
        .iter()
        .filter(|p| p["type"] == "mouseReleased")
        .collect();
    assert_eq!(pressed.len(), 1);
    assert_eq!(released.len(), 1);
    assert_eq!(pressed[0]["x"].as_f64().unwrap().round() as i64, 500);
    assert_eq!(released[0]["y"].as_f64().unwrap().round() as i64, 300);

    stack.teardown().await;
}

#[tokio::test]
async fn page_diffing_appends_confidence_section() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;

    experiments::registry().enable("page_diffing").unwrap();
    // Before and after captures, then the click's own evals.
    stack.host.script_eval(
        "shadowRootCount",
        json!({
            "elementCount": 100, "textContent": ["Hello"],
            "shadowRootCount": 0, "iframeCount": 0,
            "hiddenElementCount": 0, "pageElementCount": 1000,
        }),
    );
    stack
        .host
        .script_eval("getBoundingClientRect", json!({"x": 10.0, "y": 10.0}));
    stack.host.script_eval("el.click", json!(true));
    stack.host.script_eval(
        "shadowRootCount",
        json!({
            "elementCount": 115, "textContent": ["Hello", "Submitted"],
            "shadowRootCount": 0, "iframeCount": 0,
            "hiddenElementCount": 0, "pageElementCount": 1000,
        }),
    );

    let result = stack
        .manager
        .call_tool(
            "browser_interact",
            &json!({"actions": [{"type": "click", "selector": "#submit"}]}),
            false,
        )
        .await;
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("+15"), "text: {text}");
    assert!(text.contains("Added: Submitted"), "text: {text}");
    assert!(text.contains("Confidence: 100%"), "text: {text}");

    stack.teardown().await;
}

#[tokio::test]
async fn secure_fill_never_echoes_the_secret() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;

    // Test-local variable name to avoid cross-test collisions.
    unsafe { std::env::set_var("SUPERSURF_TEST_SECRET", "hunter2") };
    stack.host.script_eval("dispatchEvent", json!({"ok": true}));

    let result = stack
        .manager
        .call_tool(
            "browser_secure_fill",
            &json!({"selector": "#password", "env_var": "SUPERSURF_TEST_SECRET"}),
            true,
        )
        .await;
    assert_eq!(result["success"], true, "{result}");
    // The secret reached the page, but never any response payload.
    assert!(!result.to_string().contains("hunter2"));
    let evals = stack.host.cdp_calls("Runtime.evaluate");
    assert!(
        evals
            .iter()
            .any(|p| p["expression"].as_str().unwrap_or("").contains("hunter2")),
        "fill snippet should carry the value to the page"
    );

    stack.teardown().await;
}

#[tokio::test]
async fn element_not_found_offers_hints() {
    let stack = start_stack().await;
    stack
        .manager
        .call_tool("browser_tabs", &json!({"action": "attach", "tab_id": 1}), true)
        .await;

    // Selector resolution misses; the alternatives scan finds two
    // candidates.
    stack.host.script_eval("getBoundingClientRect", json!(null));
    stack
        .host
        .script_eval("visible.concat(hidden)", json!(["button.cta", "#send (hidden)"]));

    let result = stack
        .manager
        .call_tool(
            "browser_interact",
            &json!({"actions": [{"type": "click", "selector": "button:has-text(\"Submit\")"}]}),
            true,
        )
        .await;
    assert_eq!(result["success"], false, "{result}");
    let error = result["results"][0]["error"].as_str().unwrap();
    assert!(error.contains("Did you mean"), "error: {error}");
    assert!(error.contains("button.cta"), "error: {error}");

    stack.teardown().await;
}

#[tokio::test]
async fn router_schedules_reconnect_alarm_on_broker_loss() {
    let stack = start_stack().await;

    // Kill the broker side; the router's serve loop ends.
    stack.manager.disable().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), stack.router_task).await;

    // connect_and_serve returned; run() would now schedule the
    // reconnect alarm. Exercise the scheduler contract directly.
    stack
        .alarms
        .schedule(supersurf::extension::RECONNECT_ALARM, Duration::from_secs(5));
    assert_eq!(
        stack.alarms.scheduled_names(),
        vec![supersurf::extension::RECONNECT_ALARM]
    );
    experiments::registry().reset();
}
