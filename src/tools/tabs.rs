//! Tab management, delegated to the extension (the only place with
//! access to the tabs API and the debugger attachment).

use serde_json::{Value, json};

use crate::error::BrokerError;
use crate::transport::TabRecord;

use super::{ToolDispatcher, ToolReply};

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let action = args
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("action is required".into()))?;

    match action {
        "list" => list(d).await,
        "new" => open(d, args).await,
        "attach" => attach(d, args).await,
        "close" => close(d, args).await,
        other => Err(BrokerError::UnknownAction {
            tool: "browser_tabs",
            action: other.to_owned(),
        }),
    }
}

async fn list(d: &ToolDispatcher) -> Result<ToolReply, BrokerError> {
    let result = d
        .transport()
        .send_cmd("tabs", Some(json!({"action": "list"})), None)
        .await
        .map_err(BrokerError::from)?;
    let tabs = result.get("tabs").cloned().unwrap_or_else(|| Value::Array(Vec::new()));
    let count = tabs.as_array().map_or(0, Vec::len);
    Ok(ToolReply::json(
        &format!("{count} open tab(s)."),
        json!({"success": true, "tabs": tabs}),
    ))
}

async fn open(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let url = args.get("url").and_then(Value::as_str);
    let result = d
        .transport()
        .send_cmd("tabs", Some(json!({"action": "new", "url": url})), None)
        .await
        .map_err(BrokerError::from)?;
    let tab = record_attached(d, &result);
    Ok(ToolReply::json(
        &match &tab {
            Some(tab) => format!("Opened and attached tab {}.", tab.tab_id),
            None => "Opened tab.".to_owned(),
        },
        json!({"success": true, "tab": result.get("tab").cloned().unwrap_or(Value::Null)}),
    ))
}

async fn attach(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let tab_id = args
        .get("tab_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| BrokerError::InvalidParams("tab_id is required for attach".into()))?;
    let result = d
        .transport()
        .send_cmd(
            "tabs",
            Some(json!({"action": "attach", "tabId": tab_id})),
            None,
        )
        .await
        .map_err(BrokerError::from)?;
    record_attached(d, &result);
    Ok(ToolReply::json(
        &format!("Attached to tab {tab_id}."),
        json!({"success": true, "tab": result.get("tab").cloned().unwrap_or(Value::Null)}),
    ))
}

async fn close(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let tab_id = args.get("tab_id").and_then(Value::as_i64);
    let result = d
        .transport()
        .send_cmd(
            "tabs",
            Some(json!({"action": "close", "tabId": tab_id})),
            None,
        )
        .await
        .map_err(BrokerError::from)?;
    // Closing the attached tab clears the broker's tab state.
    let closed_attached = result
        .get("closedAttached")
        .and_then(Value::as_bool)
        .unwrap_or(tab_id.is_none());
    if closed_attached && let Some(manager) = d.manager() {
        manager.set_attached_tab(None);
    }
    Ok(ToolReply::json(
        "Tab closed.",
        json!({"success": true, "closed_attached": closed_attached}),
    ))
}

/// `new` and `attach` responses carry the fresh tab record; push it
/// into the manager so the status header stays current.
fn record_attached(d: &ToolDispatcher, result: &Value) -> Option<TabRecord> {
    let tab = result
        .get("tab")
        .cloned()
        .and_then(|v| serde_json::from_value::<TabRecord>(v).ok())?;
    if let Some(manager) = d.manager() {
        manager.set_attached_tab(Some(tab.clone()));
    }
    Some(tab)
}
