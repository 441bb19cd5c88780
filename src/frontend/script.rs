//! Script-mode stdio frontend: plain newline-delimited JSON-RPC 2.0
//! with batch support, dispatching tools with raw (unframed) results.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::manager::ConnectionManager;

/// Serve plain JSON-RPC over stdin/stdout until stdin closes.
pub async fn run(manager: Arc<ConnectionManager>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&manager, line).await {
            let serialized = response.to_string();
            if stdout.write_all(serialized.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                return;
            }
        }
    }
    debug!("stdin closed, script frontend exiting");
}

/// Handle one input line: a single request or a batch array.
pub async fn handle_line(manager: &Arc<ConnectionManager>, line: &str) -> Option<Value> {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Some(error_response(
                Value::Null,
                -32700,
                &format!("parse error: {e}"),
            ));
        }
    };

    match parsed {
        Value::Array(batch) => {
            if batch.is_empty() {
                return Some(error_response(Value::Null, -32600, "empty batch"));
            }
            let mut responses = Vec::new();
            for request in batch {
                if let Some(response) = handle_request(manager, &request).await {
                    responses.push(response);
                }
            }
            if responses.is_empty() {
                None
            } else {
                Some(Value::Array(responses))
            }
        }
        request => handle_request(manager, &request).await,
    }
}

async fn handle_request(manager: &Arc<ConnectionManager>, request: &Value) -> Option<Value> {
    let id = request.get("id").cloned();

    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Some(error_response(
            id.unwrap_or(Value::Null),
            -32600,
            "invalid request: jsonrpc must be \"2.0\"",
        ));
    }
    let method = match request.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m,
        _ => {
            return Some(error_response(
                id.unwrap_or(Value::Null),
                -32600,
                "invalid request: method is required",
            ));
        }
    };

    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));
    let result = manager.call_tool(method, &params, true).await;

    // Notifications execute but get no response.
    let id = id?;

    if result.get("success").and_then(Value::as_bool) == Some(false) {
        let message = result
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("tool error")
            .to_owned();
        return Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32000, "message": message, "data": result},
        }));
    }
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(Config::default())
    }

    #[tokio::test]
    async fn parse_error_yields_32700() {
        let response = handle_line(&manager(), "{{{").await.unwrap();
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], Value::Null);
    }

    #[tokio::test]
    async fn missing_jsonrpc_is_invalid() {
        let response = handle_line(&manager(), r#"{"id":1,"method":"status"}"#)
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn empty_method_is_invalid() {
        let response = handle_line(&manager(), r#"{"jsonrpc":"2.0","id":1,"method":""}"#)
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn status_returns_raw_result() {
        let response = handle_line(&manager(), r#"{"jsonrpc":"2.0","id":7,"method":"status"}"#)
            .await
            .unwrap();
        assert_eq!(response["id"], 7);
        assert_eq!(response["result"]["state"], "passive");
        // Raw mode carries no MCP content envelope.
        assert!(response["result"].get("content").is_none());
    }

    #[tokio::test]
    async fn tool_error_yields_32000() {
        let response = handle_line(
            &manager(),
            r#"{"jsonrpc":"2.0","id":8,"method":"enable","params":{}}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["error"]["data"]["error"], "missing_client_id");
    }

    #[tokio::test]
    async fn batch_processes_each_entry() {
        let line = r#"[{"jsonrpc":"2.0","id":1,"method":"status"},{"jsonrpc":"2.0","id":2,"method":"status"}]"#;
        let response = handle_line(&manager(), line).await.unwrap();
        let responses = response.as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[1]["id"], 2);
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let response = handle_line(&manager(), "[]").await.unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn notification_gets_no_response() {
        let response = handle_line(&manager(), r#"{"jsonrpc":"2.0","method":"status"}"#).await;
        assert!(response.is_none());
    }
}
