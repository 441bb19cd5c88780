//! MCP-framed stdio frontend: newline-delimited JSON-RPC with the
//! `initialize` / `tools/list` / `tools/call` surface and
//! content/isError result envelopes.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::manager::{ConnectionManager, FrontendEvent};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Serve MCP over stdin/stdout until stdin closes.
pub async fn run(manager: Arc<ConnectionManager>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_loop(out_rx));

    // Tool-list changes surface as MCP notifications.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<FrontendEvent>();
    manager.set_notifier(event_tx);
    {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(FrontendEvent::ToolListChanged) = event_rx.recv().await {
                let note =
                    json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"});
                let _ = out_tx.send(note.to_string());
            }
        });
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        let manager = Arc::clone(&manager);
        let out_tx = out_tx.clone();
        // Requests run concurrently; responses correlate by id.
        tokio::spawn(async move {
            if let Some(response) = handle_line(&manager, &line).await {
                let _ = out_tx.send(response.to_string());
            }
        });
    }
    debug!("stdin closed, MCP frontend exiting");
    drop(out_tx);
    let _ = writer.await;
}

async fn write_loop(mut out_rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = out_rx.recv().await {
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            warn!("stdout closed");
            return;
        }
    }
}

async fn handle_line(manager: &Arc<ConnectionManager>, line: &str) -> Option<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Some(error_response(
                Value::Null,
                -32700,
                &format!("parse error: {e}"),
            ));
        }
    };

    let id = request.get("id").cloned();
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");

    match (id, method) {
        (Some(id), "initialize") => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "supersurf", "version": crate::VERSION},
            },
        })),
        (Some(id), "ping") => Some(json!({"jsonrpc": "2.0", "id": id, "result": {}})),
        (Some(id), "tools/list") => {
            let tools: Vec<Value> = manager
                .list_tools()
                .into_iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "inputSchema": spec.input_schema,
                    })
                })
                .collect();
            Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": tools},
            }))
        }
        (Some(id), "tools/call") => {
            let name = request
                .pointer("/params/name")
                .and_then(Value::as_str)
                .unwrap_or("");
            let arguments = request
                .pointer("/params/arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let result = manager.call_tool(name, &arguments, false).await;
            Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
        }
        (Some(id), other) => Some(error_response(
            id,
            -32601,
            &format!("method not found: {other}"),
        )),
        (None, "notifications/initialized" | "notifications/cancelled") => None,
        (None, other) => {
            debug!(method = other, "ignoring notification");
            None
        }
    }
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
    async fn initialize_reports_identity() {
        let response = handle_line(&manager(), r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await
            .unwrap();
        assert_eq!(response["result"]["serverInfo"]["name"], "supersurf");
        assert_eq!(
            response["result"]["capabilities"]["tools"]["listChanged"],
            true
        );
    }

    #[tokio::test]
    async fn tools_list_includes_connection_tools() {
        let response = handle_line(&manager(), r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "enable"));
    }

    #[tokio::test]
    async fn tools_call_frames_result() {
        let response = handle_line(
            &manager(),
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"status","arguments":{}}}"#,
        )
        .await
        .unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        // Framed responses always open with the status header.
        assert!(text.starts_with("🔴 v"));
    }

    #[tokio::test]
    async fn tools_call_enable_without_client_id_is_error_envelope() {
        let response = handle_line(
            &manager(),
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"enable","arguments":{}}}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("client_id"));
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let response = handle_line(&manager(), r#"{"jsonrpc":"2.0","id":5,"method":"nope"}"#)
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn parse_error_is_32700() {
        let response = handle_line(&manager(), "{not json").await.unwrap();
        assert_eq!(response["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let response = handle_line(
            &manager(),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(response.is_none());
    }
}
