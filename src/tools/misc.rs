//! Smaller tools: drag, PDF export, extension listing, window control,
//! dialog handling, performance metrics, and secure fill.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::error::BrokerError;

use super::{CAPTURE_TIMEOUT, ToolDispatcher, ToolReply};

// ===========================================================================
// browser_drag
// ===========================================================================

/// Interpolated move count between press and release.
const DRAG_STEPS: u32 = 10;

pub async fn drag(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let from = required_str(args, "from")?;
    let to = required_str(args, "to")?;

    let (x0, y0) = resolve_point(d, from).await?;
    let (x1, y1) = resolve_point(d, to).await?;

    d.cdp(
        "Input.dispatchMouseEvent",
        json!({"type": "mousePressed", "x": x0, "y": y0, "button": "left", "clickCount": 1}),
    )
    .await?;

    for step in 1..=DRAG_STEPS {
        let t = f64::from(step) / f64::from(DRAG_STEPS);
        let x = x0 + (x1 - x0) * t;
        let y = y0 + (y1 - y0) * t;
        d.cdp(
            "Input.dispatchMouseEvent",
            json!({"type": "mouseMoved", "x": x, "y": y, "buttons": 1}),
        )
        .await?;
        d.sleep(20).await;
    }

    d.cdp(
        "Input.dispatchMouseEvent",
        json!({"type": "mouseReleased", "x": x1, "y": y1, "button": "left", "clickCount": 1}),
    )
    .await?;

    Ok(ToolReply::json(
        &format!("Dragged {from} to {to}."),
        json!({"success": true, "from": from, "to": to}),
    ))
}

/// A drag endpoint is either a selector or an `x,y` coordinate pair.
async fn resolve_point(d: &ToolDispatcher, target: &str) -> Result<(f64, f64), BrokerError> {
    if let Some((x, y)) = parse_coordinates(target) {
        return Ok((x, y));
    }
    d.get_element_center(target).await
}

fn parse_coordinates(target: &str) -> Option<(f64, f64)> {
    let (x, y) = target.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

// ===========================================================================
// browser_pdf_save
// ===========================================================================

pub async fn pdf_save(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let path = required_str(args, "file_path")?;
    let result = d
        .cdp_with_timeout("Page.printToPDF", json!({}), Some(CAPTURE_TIMEOUT))
        .await?;
    let data = result
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Peer {
            message: "printToPDF returned no data".into(),
        })?;
    let bytes = BASE64
        .decode(data)
        .map_err(|e| BrokerError::Io(format!("invalid pdf payload: {e}")))?;
    let size = bytes.len();
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| BrokerError::Io(format!("writing {path}: {e}")))?;
    Ok(ToolReply::json(
        &format!("Saved PDF to {path} ({size} bytes)."),
        json!({"success": true, "file_path": path, "bytes": size}),
    ))
}

// ===========================================================================
// browser_list_extensions
// ===========================================================================

pub async fn list_extensions(d: &ToolDispatcher, _args: &Value) -> Result<ToolReply, BrokerError> {
    let result = d
        .transport()
        .send_cmd("listExtensions", None, None)
        .await
        .map_err(BrokerError::from)?;
    let extensions = result
        .get("extensions")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));
    let count = extensions.as_array().map_or(0, Vec::len);
    Ok(ToolReply::json(
        &format!("{count} extension(s) installed."),
        json!({"success": true, "extensions": extensions}),
    ))
}

// ===========================================================================
// browser_window
// ===========================================================================

pub async fn window(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let action = required_str(args, "action")?;
    let window_info = d
        .cdp("Browser.getWindowForTarget", json!({}))
        .await?;
    let window_id = window_info
        .get("windowId")
        .and_then(Value::as_i64)
        .ok_or_else(|| BrokerError::Peer {
            message: "no window for target".into(),
        })?;

    match action {
        "bounds" => {
            let bounds = window_info.get("bounds").cloned().unwrap_or(Value::Null);
            Ok(ToolReply::json(
                "Window bounds.",
                json!({"success": true, "window_id": window_id, "bounds": bounds}),
            ))
        }
        "resize" => {
            let width = args.get("width").and_then(Value::as_i64);
            let height = args.get("height").and_then(Value::as_i64);
            let (Some(width), Some(height)) = (width, height) else {
                return Err(BrokerError::InvalidParams(
                    "resize requires width and height".into(),
                ));
            };
            d.cdp(
                "Browser.setWindowBounds",
                json!({
                    "windowId": window_id,
                    "bounds": {"windowState": "normal", "width": width, "height": height},
                }),
            )
            .await?;
            Ok(ToolReply::json(
                &format!("Resized window to {width}x{height}."),
                json!({"success": true, "width": width, "height": height}),
            ))
        }
        "maximize" | "minimize" | "fullscreen" => {
            let state = match action {
                "maximize" => "maximized",
                "minimize" => "minimized",
                _ => "fullscreen",
            };
            d.cdp(
                "Browser.setWindowBounds",
                json!({"windowId": window_id, "bounds": {"windowState": state}}),
            )
            .await?;
            Ok(ToolReply::json(
                &format!("Window {state}."),
                json!({"success": true, "state": state}),
            ))
        }
        other => Err(BrokerError::UnknownAction {
            tool: "browser_window",
            action: other.to_owned(),
        }),
    }
}

// ===========================================================================
// browser_handle_dialog
// ===========================================================================

pub async fn handle_dialog(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let accept = args
        .get("accept")
        .and_then(Value::as_bool)
        .ok_or_else(|| BrokerError::InvalidParams("accept is required".into()))?;
    let mut params = json!({"accept": accept});
    if let Some(text) = args.get("prompt_text").and_then(Value::as_str) {
        params["promptText"] = Value::String(text.to_owned());
    }
    d.cdp("Page.handleJavaScriptDialog", params).await?;
    Ok(ToolReply::json(
        &format!("Dialog {}.", if accept { "accepted" } else { "dismissed" }),
        json!({"success": true, "accepted": accept}),
    ))
}

// ===========================================================================
// browser_performance_metrics
// ===========================================================================

pub async fn performance_metrics(
    d: &ToolDispatcher,
    _args: &Value,
) -> Result<ToolReply, BrokerError> {
    d.cdp("Performance.enable", json!({})).await?;
    let result = d.cdp("Performance.getMetrics", json!({})).await?;
    let metrics: serde_json::Map<String, Value> = result
        .get("metrics")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    Some((
                        m.get("name")?.as_str()?.to_owned(),
                        m.get("value")?.clone(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(ToolReply::json(
        &format!("{} metric(s).", metrics.len()),
        json!({"success": true, "metrics": metrics}),
    ))
}

// ===========================================================================
// browser_secure_fill
// ===========================================================================

/// Fill a field from a broker-side environment variable. The value goes
/// to the extension and nowhere else: it is never logged, echoed, or
/// included in any response payload.
pub async fn secure_fill(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let selector = required_str(args, "selector")?;
    let env_var = required_str(args, "env_var")?;

    let value = std::env::var(env_var).map_err(|_| {
        BrokerError::InvalidParams(format!("environment variable {env_var} is not set"))
    })?;

    d.transport()
        .send_cmd(
            "secureFill",
            Some(json!({"selector": selector, "value": value})),
            None,
        )
        .await
        .map_err(BrokerError::from)?;

    Ok(ToolReply::json(
        &format!("Filled {selector} from ${env_var}."),
        json!({"success": true, "selector": selector, "source": env_var}),
    ))
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, BrokerError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams(format!("{key} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_coordinate_pairs() {
        assert_eq!(parse_coordinates("100, 250"), Some((100.0, 250.0)));
        assert_eq!(parse_coordinates("12.5,7"), Some((12.5, 7.0)));
        assert_eq!(parse_coordinates("#drop-zone"), None);
        assert_eq!(parse_coordinates("a,b"), None);
    }

    #[test]
    fn required_str_errors_on_missing() {
        let args = json!({"present": "x"});
        assert_eq!(required_str(&args, "present").unwrap(), "x");
        assert!(required_str(&args, "absent").is_err());
    }
}
