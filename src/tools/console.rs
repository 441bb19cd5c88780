//! Console message inspection, backed by the extension's buffered
//! capture.

use serde_json::{Value, json};

use crate::error::BrokerError;

use super::{ToolDispatcher, ToolReply};

const DEFAULT_LIMIT: u64 = 50;

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let action = args.get("action").and_then(Value::as_str).unwrap_or("list");
    match action {
        "list" => list(d, args).await,
        "clear" => clear(d).await,
        other => Err(BrokerError::UnknownAction {
            tool: "browser_console_messages",
            action: other.to_owned(),
        }),
    }
}

async fn list(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let result = d
        .transport()
        .send_cmd(
            "consoleMessages",
            Some(json!({
                "action": "list",
                "level": args.get("level"),
                "filter": args.get("filter"),
                "offset": args.get("offset").and_then(Value::as_u64).unwrap_or(0),
                "limit": args.get("limit").and_then(Value::as_u64).unwrap_or(DEFAULT_LIMIT),
            })),
            None,
        )
        .await
        .map_err(BrokerError::from)?;

    let messages = result
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let total = result
        .get("total")
        .and_then(Value::as_u64)
        .unwrap_or(messages.len() as u64);

    let lines: Vec<String> = messages
        .iter()
        .map(|m| {
            format!(
                "[{}] {}",
                m.get("level").and_then(Value::as_str).unwrap_or("log"),
                m.get("text").and_then(Value::as_str).unwrap_or(""),
            )
        })
        .collect();
    let text = if lines.is_empty() {
        "No console messages.".to_owned()
    } else {
        format!(
            "{} message(s), {total} total:\n{}",
            lines.len(),
            lines.join("\n")
        )
    };
    Ok(ToolReply::text(
        text,
        json!({"success": true, "messages": messages, "total": total}),
    ))
}

async fn clear(d: &ToolDispatcher) -> Result<ToolReply, BrokerError> {
    d.transport()
        .send_cmd("consoleMessages", Some(json!({"action": "clear"})), None)
        .await
        .map_err(BrokerError::from)?;
    Ok(ToolReply::json(
        "Console cleared.",
        json!({"success": true}),
    ))
}
