//! Sequential page interactions: each call carries a list of actions
//! executed in order, with per-action error policy and optional
//! before/after page diffing.

use serde_json::{Value, json};

use crate::error::BrokerError;
use crate::experiments;
use crate::humanize;

use super::primitives::{RESOLVE_SELECTOR_JS, json_string};
use super::{ToolDispatcher, ToolReply, diff};

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let actions = args
        .get("actions")
        .and_then(Value::as_array)
        .ok_or_else(|| BrokerError::InvalidParams("actions must be an array".into()))?;
    let stop_on_error = args
        .get("on_error")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        != "ignore";

    let diffing = experiments::registry().is_enabled("page_diffing");
    let before = if diffing {
        diff::capture_page_state(d.transport()).await.ok()
    } else {
        None
    };

    let mut results = Vec::with_capacity(actions.len());
    let mut failed = false;
    for (index, action) in actions.iter().enumerate() {
        match perform_action(d, action).await {
            Ok(description) => {
                results.push(json!({"index": index, "success": true, "action": description}));
            }
            Err(err) => {
                results.push(json!({
                    "index": index,
                    "success": false,
                    "error": err.to_string(),
                }));
                if stop_on_error {
                    failed = true;
                    break;
                }
            }
        }
    }

    let mut text = summarize(&results, failed);
    if let Some(before) = before {
        // Best-effort: a failed after-capture simply omits the section.
        if let Ok(after) = diff::capture_page_state(d.transport()).await {
            let changes = diff::diff_snapshots(&before, &after);
            let confidence = diff::calculate_confidence(&after);
            if let Some(section) = diff::render_diff(&changes, confidence) {
                text.push_str(&section);
            }
        }
    }

    let reply = ToolReply::text(
        text,
        json!({"success": !failed, "results": results}),
    );
    Ok(if failed {
        ToolReply {
            is_error: true,
            ..reply
        }
    } else {
        reply
    })
}

fn summarize(results: &[Value], failed: bool) -> String {
    let mut lines: Vec<String> = results
        .iter()
        .map(|r| {
            if r["success"].as_bool().unwrap_or(false) {
                format!("✓ {}", r["action"].as_str().unwrap_or("action"))
            } else {
                format!("✗ {}", r["error"].as_str().unwrap_or("failed"))
            }
        })
        .collect();
    if failed {
        lines.push("Stopped after first failure.".to_owned());
    }
    lines.join("\n")
}

async fn perform_action(d: &ToolDispatcher, action: &Value) -> Result<String, BrokerError> {
    let kind = action
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("action requires a type".into()))?;

    match kind {
        "click" => click(d, required_selector(action)?, action).await,
        "type" => type_text(d, required_selector(action)?, action).await,
        "clear" => clear(d, required_selector(action)?).await,
        "press_key" => press_key(d, action).await,
        "hover" => hover(d, required_selector(action)?).await,
        "wait" => wait_action(d, action).await,
        "mouse_move" => mouse_move(d, action).await,
        "mouse_click" => mouse_click(d, action).await,
        "scroll_to" => scroll_to(d, action).await,
        "scroll_by" => scroll_by(d, action).await,
        "scroll_into_view" => scroll_into_view(d, required_selector(action)?).await,
        "select_option" => select_option(d, required_selector(action)?, action).await,
        "file_upload" => file_upload(d, required_selector(action)?, action).await,
        "force_pseudo_state" => force_pseudo_state(d, required_selector(action)?, action).await,
        other => Err(BrokerError::UnknownAction {
            tool: "browser_interact",
            action: other.to_owned(),
        }),
    }
}

fn required_selector(action: &Value) -> Result<&str, BrokerError> {
    action
        .get("selector")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("selector is required".into()))
}

// ---------------------------------------------------------------------------
// Pointer actions
// ---------------------------------------------------------------------------

/// Move the cursor to a point, humanized when the experiment is on.
pub(crate) async fn move_pointer(d: &ToolDispatcher, x: f64, y: f64) -> Result<(), BrokerError> {
    let tab_id = d
        .manager()
        .and_then(|m| m.attached_tab())
        .map_or(0, |tab| tab.tab_id);

    if experiments::registry().is_enabled("mouse_humanization") {
        let from = d.cursor_position(tab_id);
        let viewport = viewport_size(d).await.unwrap_or((1920.0, 1080.0));
        let personality = d.personality();
        let path =
            humanize::generate_path(from, (x, y), viewport, personality, &mut rand::thread_rng());
        let waypoints: Vec<Value> = path
            .iter()
            .map(|w| json!({"x": w.x, "y": w.y, "delayMs": w.delay_ms}))
            .collect();
        d.transport()
            .send_cmd(
                "humanizedMouseMove",
                Some(json!({"tabId": tab_id, "waypoints": waypoints})),
                None,
            )
            .await
            .map_err(BrokerError::from)?;
    } else {
        d.cdp(
            "Input.dispatchMouseEvent",
            json!({"type": "mouseMoved", "x": x, "y": y}),
        )
        .await?;
    }
    d.set_cursor_position(tab_id, (x, y));
    Ok(())
}

async fn viewport_size(d: &ToolDispatcher) -> Option<(f64, f64)> {
    let value = d
        .eval("({w: window.innerWidth, h: window.innerHeight})")
        .await
        .ok()?;
    Some((value.get("w")?.as_f64()?, value.get("h")?.as_f64()?))
}

/// Press and release at a point through CDP.
pub(crate) async fn click_at(d: &ToolDispatcher, x: f64, y: f64) -> Result<(), BrokerError> {
    d.cdp(
        "Input.dispatchMouseEvent",
        json!({
            "type": "mousePressed",
            "x": x, "y": y,
            "button": "left",
            "clickCount": 1,
        }),
    )
    .await?;
    d.cdp(
        "Input.dispatchMouseEvent",
        json!({
            "type": "mouseReleased",
            "x": x, "y": y,
            "button": "left",
            "clickCount": 1,
        }),
    )
    .await?;
    Ok(())
}

async fn click(d: &ToolDispatcher, selector: &str, _action: &Value) -> Result<String, BrokerError> {
    let (x, y) = d.get_element_center(selector).await?;
    move_pointer(d, x, y).await?;
    click_at(d, x, y).await?;
    // Synthetic CDP clicks occasionally fail to trigger navigation on
    // framework-bound anchors; a DOM-level click closes that gap.
    let snippet = format!(
        r"(function() {{
{RESOLVE_SELECTOR_JS}
  var el = __resolveSelector({sel});
  if (el && typeof el.click === 'function') {{ el.click(); }}
  return true;
}})()",
        sel = json_string(selector),
    );
    let _ = d.eval(&snippet).await;
    Ok(format!("clicked {selector}"))
}

async fn hover(d: &ToolDispatcher, selector: &str) -> Result<String, BrokerError> {
    let (x, y) = d.get_element_center(selector).await?;
    move_pointer(d, x, y).await?;
    Ok(format!("hovered {selector}"))
}

async fn mouse_move(d: &ToolDispatcher, action: &Value) -> Result<String, BrokerError> {
    let (x, y) = point_args(action)?;
    move_pointer(d, x, y).await?;
    Ok(format!("moved mouse to ({x}, {y})"))
}

async fn mouse_click(d: &ToolDispatcher, action: &Value) -> Result<String, BrokerError> {
    let (x, y) = point_args(action)?;
    move_pointer(d, x, y).await?;
    click_at(d, x, y).await?;
    Ok(format!("clicked at ({x}, {y})"))
}

fn point_args(action: &Value) -> Result<(f64, f64), BrokerError> {
    let x = action.get("x").and_then(Value::as_f64);
    let y = action.get("y").and_then(Value::as_f64);
    match (x, y) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(BrokerError::InvalidParams("x and y are required".into())),
    }
}

// ---------------------------------------------------------------------------
// Keyboard and value actions
// ---------------------------------------------------------------------------

/// Set an input's value through the native setter so framework-wrapped
/// inputs still observe `input`/`change`.
pub(crate) fn native_set_value_snippet(selector: &str, value: &str, append: bool) -> String {
    format!(
        r"(function() {{
{RESOLVE_SELECTOR_JS}
  var el = __resolveSelector({sel});
  if (!el) {{ return {{ok: false, reason: 'not found'}}; }}
  el.focus();
  var proto = el instanceof HTMLTextAreaElement
    ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  var desc = Object.getOwnPropertyDescriptor(proto, 'value');
  var next = {append} ? (el.value || '') + {val} : {val};
  if (desc && desc.set) {{ desc.set.call(el, next); }} else {{ el.value = next; }}
  el.dispatchEvent(new Event('input', {{bubbles: true}}));
  el.dispatchEvent(new Event('change', {{bubbles: true}}));
  return {{ok: true}};
}})()",
        sel = json_string(selector),
        val = json_string(value),
        append = append,
    )
}

async fn type_text(
    d: &ToolDispatcher,
    selector: &str,
    action: &Value,
) -> Result<String, BrokerError> {
    let text = action
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("text is required".into()))?;
    let append = action
        .get("append")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let result = d
        .eval(&native_set_value_snippet(selector, text, append))
        .await?;
    if result.get("ok").and_then(Value::as_bool) != Some(true) {
        let hints = super::find_alternatives(d.transport(), selector).await;
        return Err(BrokerError::ElementNotFound {
            selector: selector.to_owned(),
            hints,
        });
    }
    Ok(format!("typed {} character(s) into {selector}", text.len()))
}

async fn clear(d: &ToolDispatcher, selector: &str) -> Result<String, BrokerError> {
    let result = d.eval(&native_set_value_snippet(selector, "", false)).await?;
    if result.get("ok").and_then(Value::as_bool) != Some(true) {
        return Err(BrokerError::ElementNotFound {
            selector: selector.to_owned(),
            hints: Vec::new(),
        });
    }
    Ok(format!("cleared {selector}"))
}

/// Key definitions for `Input.dispatchKeyEvent`. Single characters fall
/// through to a text key event.
fn key_definition(key: &str) -> Option<(&'static str, i64)> {
    Some(match key {
        "Enter" => ("Enter", 13),
        "Tab" => ("Tab", 9),
        "Escape" => ("Escape", 27),
        "Backspace" => ("Backspace", 8),
        "Delete" => ("Delete", 46),
        "ArrowUp" => ("ArrowUp", 38),
        "ArrowDown" => ("ArrowDown", 40),
        "ArrowLeft" => ("ArrowLeft", 37),
        "ArrowRight" => ("ArrowRight", 39),
        "Home" => ("Home", 36),
        "End" => ("End", 35),
        "PageUp" => ("PageUp", 33),
        "PageDown" => ("PageDown", 34),
        _ => return None,
    })
}

async fn press_key(d: &ToolDispatcher, action: &Value) -> Result<String, BrokerError> {
    let key = action
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("key is required".into()))?;

    if let Some((name, code)) = key_definition(key) {
        d.cdp(
            "Input.dispatchKeyEvent",
            json!({
                "type": "rawKeyDown",
                "key": name,
                "windowsVirtualKeyCode": code,
                "nativeVirtualKeyCode": code,
            }),
        )
        .await?;
        if name == "Enter" {
            d.cdp(
                "Input.dispatchKeyEvent",
                json!({"type": "char", "text": "\r", "key": "Enter"}),
            )
            .await?;
        }
        d.cdp(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": name,
                "windowsVirtualKeyCode": code,
                "nativeVirtualKeyCode": code,
            }),
        )
        .await?;
    } else if key.chars().count() == 1 {
        d.cdp(
            "Input.dispatchKeyEvent",
            json!({"type": "keyDown", "text": key, "key": key}),
        )
        .await?;
        d.cdp(
            "Input.dispatchKeyEvent",
            json!({"type": "keyUp", "key": key}),
        )
        .await?;
    } else {
        return Err(BrokerError::InvalidParams(format!("unsupported key: {key}")));
    }
    Ok(format!("pressed {key}"))
}

async fn wait_action(d: &ToolDispatcher, action: &Value) -> Result<String, BrokerError> {
    let ms = action.get("ms").and_then(Value::as_u64).unwrap_or(1000);
    d.sleep(ms).await;
    Ok(format!("waited {ms}ms"))
}

// ---------------------------------------------------------------------------
// Scrolling
// ---------------------------------------------------------------------------

async fn scroll_to(d: &ToolDispatcher, action: &Value) -> Result<String, BrokerError> {
    let (x, y) = point_args(action)?;
    d.eval(&format!("window.scrollTo({x}, {y})")).await?;
    Ok(format!("scrolled to ({x}, {y})"))
}

async fn scroll_by(d: &ToolDispatcher, action: &Value) -> Result<String, BrokerError> {
    let dx = action.get("dx").and_then(Value::as_f64).unwrap_or(0.0);
    let dy = action.get("dy").and_then(Value::as_f64).unwrap_or(0.0);
    d.eval(&format!("window.scrollBy({dx}, {dy})")).await?;
    Ok(format!("scrolled by ({dx}, {dy})"))
}

pub(crate) async fn scroll_into_view(
    d: &ToolDispatcher,
    selector: &str,
) -> Result<String, BrokerError> {
    let snippet = format!(
        r"(function() {{
{RESOLVE_SELECTOR_JS}
  var el = __resolveSelector({sel});
  if (!el) {{ return false; }}
  el.scrollIntoView({{block: 'center', inline: 'center'}});
  return true;
}})()",
        sel = json_string(selector),
    );
    if d.eval(&snippet).await? != Value::Bool(true) {
        let hints = super::find_alternatives(d.transport(), selector).await;
        return Err(BrokerError::ElementNotFound {
            selector: selector.to_owned(),
            hints,
        });
    }
    Ok(format!("scrolled {selector} into view"))
}

// ---------------------------------------------------------------------------
// Form-ish actions
// ---------------------------------------------------------------------------

async fn select_option(
    d: &ToolDispatcher,
    selector: &str,
    action: &Value,
) -> Result<String, BrokerError> {
    let values: Vec<String> = match action.get("values") {
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => action
            .get("value")
            .and_then(Value::as_str)
            .map(|v| vec![v.to_owned()])
            .ok_or_else(|| BrokerError::InvalidParams("value or values required".into()))?,
    };
    let snippet = super::forms::select_option_snippet(selector, &values);
    let result = d.eval(&snippet).await?;
    if result.get("ok").and_then(Value::as_bool) != Some(true) {
        return Err(BrokerError::ElementNotFound {
            selector: selector.to_owned(),
            hints: Vec::new(),
        });
    }
    Ok(format!("selected {} option(s) in {selector}", values.len()))
}

async fn file_upload(
    d: &ToolDispatcher,
    selector: &str,
    action: &Value,
) -> Result<String, BrokerError> {
    let files: Vec<String> = action
        .get("files")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .ok_or_else(|| BrokerError::InvalidParams("files array is required".into()))?;
    let node_id = resolve_node_id(d, selector).await?;
    d.cdp(
        "DOM.setFileInputFiles",
        json!({"files": files, "nodeId": node_id}),
    )
    .await?;
    Ok(format!("uploaded {} file(s) to {selector}", files.len()))
}

async fn force_pseudo_state(
    d: &ToolDispatcher,
    selector: &str,
    action: &Value,
) -> Result<String, BrokerError> {
    let state = action
        .get("state")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("state is required".into()))?;
    d.cdp("DOM.enable", json!({})).await?;
    d.cdp("CSS.enable", json!({})).await?;
    let node_id = resolve_node_id(d, selector).await?;
    d.cdp(
        "CSS.forcePseudoState",
        json!({"nodeId": node_id, "forcedPseudoClasses": [state]}),
    )
    .await?;
    Ok(format!("forced :{state} on {selector}"))
}

/// Resolve a plain CSS selector to a CDP node id.
pub(crate) async fn resolve_node_id(
    d: &ToolDispatcher,
    selector: &str,
) -> Result<i64, BrokerError> {
    let doc = d.cdp("DOM.getDocument", json!({"depth": 0})).await?;
    let root_id = doc
        .pointer("/root/nodeId")
        .and_then(Value::as_i64)
        .ok_or_else(|| BrokerError::Peer {
            message: "DOM.getDocument returned no root".into(),
        })?;
    let found = d
        .cdp(
            "DOM.querySelector",
            json!({"nodeId": root_id, "selector": selector}),
        )
        .await?;
    let node_id = found.get("nodeId").and_then(Value::as_i64).unwrap_or(0);
    if node_id == 0 {
        let hints = super::find_alternatives(d.transport(), selector).await;
        return Err(BrokerError::ElementNotFound {
            selector: selector.to_owned(),
            hints,
        });
    }
    Ok(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_setter_snippet_embeds_escaped_values() {
        let snippet = native_set_value_snippet("#email", "a\"b", false);
        assert!(snippet.contains(r##""#email""##));
        assert!(snippet.contains(r#""a\"b""#));
        assert!(snippet.contains("dispatchEvent(new Event('input'"));
    }

    #[test]
    fn key_definitions_cover_navigation_keys() {
        assert_eq!(key_definition("Enter"), Some(("Enter", 13)));
        assert_eq!(key_definition("ArrowDown"), Some(("ArrowDown", 40)));
        assert!(key_definition("F13").is_none());
    }

    #[test]
    fn summarize_marks_failures() {
        let results = vec![
            json!({"index": 0, "success": true, "action": "clicked #a"}),
            json!({"index": 1, "success": false, "error": "no element"}),
        ];
        let text = summarize(&results, true);
        assert!(text.contains("✓ clicked #a"));
        assert!(text.contains("✗ no element"));
        assert!(text.contains("Stopped after first failure."));
    }
}
