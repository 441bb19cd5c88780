//! Network request inspection and replay, backed by the extension's
//! capture buffer.

use serde_json::{Value, json};

use crate::error::BrokerError;

use super::primitives::json_string;
use super::{ToolDispatcher, ToolReply};

const DEFAULT_LIMIT: u64 = 30;

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let action = args.get("action").and_then(Value::as_str).unwrap_or("list");
    match action {
        "list" => list(d, args).await,
        "details" => details(d, args).await,
        "replay" => replay(d, args).await,
        "clear" => clear(d).await,
        other => Err(BrokerError::UnknownAction {
            tool: "browser_network_requests",
            action: other.to_owned(),
        }),
    }
}

async fn list(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let result = d
        .transport()
        .send_cmd(
            "networkRequests",
            Some(json!({
                "action": "list",
                "filter": args.get("filter"),
                "offset": args.get("offset").and_then(Value::as_u64).unwrap_or(0),
                "limit": args.get("limit").and_then(Value::as_u64).unwrap_or(DEFAULT_LIMIT),
            })),
            None,
        )
        .await
        .map_err(BrokerError::from)?;

    let requests = result
        .get("requests")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let total = result
        .get("total")
        .and_then(Value::as_u64)
        .unwrap_or(requests.len() as u64);

    let lines: Vec<String> = requests
        .iter()
        .map(|r| {
            format!(
                "{} {} {} → {}",
                r.get("requestId").and_then(Value::as_str).unwrap_or("?"),
                r.get("method").and_then(Value::as_str).unwrap_or("GET"),
                r.get("url").and_then(Value::as_str).unwrap_or(""),
                r.get("status")
                    .and_then(Value::as_u64)
                    .map_or("pending".to_owned(), |s| s.to_string()),
            )
        })
        .collect();
    let text = if lines.is_empty() {
        "No captured requests.".to_owned()
    } else {
        format!(
            "{} request(s), {total} total:\n{}",
            lines.len(),
            lines.join("\n")
        )
    };
    Ok(ToolReply::text(
        text,
        json!({"success": true, "requests": requests, "total": total}),
    ))
}

async fn details(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let request_id = required_request_id(args)?;
    let result = d
        .transport()
        .send_cmd(
            "networkRequests",
            Some(json!({"action": "details", "requestId": request_id})),
            None,
        )
        .await
        .map_err(BrokerError::from)?;
    Ok(ToolReply::json(
        &format!("Request {request_id}."),
        json!({"success": true, "request": result.get("request").cloned().unwrap_or(Value::Null)}),
    ))
}

/// Re-issue a captured request as an in-page `fetch` with the original
/// method and body, so cookies and origin match the page.
async fn replay(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let request_id = required_request_id(args)?;
    let lookup = d
        .transport()
        .send_cmd(
            "networkRequests",
            Some(json!({"action": "details", "requestId": request_id})),
            None,
        )
        .await
        .map_err(BrokerError::from)?;
    let request = lookup.get("request").ok_or_else(|| BrokerError::Peer {
        message: format!("request {request_id} not found"),
    })?;

    let url = request
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Peer {
            message: "captured request has no url".into(),
        })?;
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET");
    let body = request.get("postData").and_then(Value::as_str);

    let snippet = replay_snippet(url, method, body);
    let outcome = d.eval(&snippet).await?;

    let status = outcome.get("status").and_then(Value::as_u64).unwrap_or(0);
    Ok(ToolReply::json(
        &format!("Replayed {method} {url} → {status}."),
        json!({
            "success": true,
            "replayed": {"url": url, "method": method},
            "response": outcome,
        }),
    ))
}

fn replay_snippet(url: &str, method: &str, body: Option<&str>) -> String {
    let body_literal = body.map_or("undefined".to_owned(), json_string);
    format!(
        r"(async function() {{
  var resp = await fetch({url}, {{
    method: {method},
    body: {body_literal},
    credentials: 'include',
  }});
  var text = await resp.text();
  return {{
    status: resp.status,
    statusText: resp.statusText,
    body: text.slice(0, 4096),
    truncated: text.length > 4096,
  }};
}})()",
        url = json_string(url),
        method = json_string(method),
    )
}

async fn clear(d: &ToolDispatcher) -> Result<ToolReply, BrokerError> {
    d.transport()
        .send_cmd("networkRequests", Some(json!({"action": "clear"})), None)
        .await
        .map_err(BrokerError::from)?;
    Ok(ToolReply::json(
        "Network capture cleared.",
        json!({"success": true}),
    ))
}

fn required_request_id(args: &Value) -> Result<&str, BrokerError> {
    args.get("request_id")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("request_id is required".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_snippet_includes_method_and_body() {
        let snippet = replay_snippet("https://api.example.com/x", "POST", Some("{\"a\":1}"));
        assert!(snippet.contains(r#""https://api.example.com/x""#));
        assert!(snippet.contains(r#""POST""#));
        assert!(snippet.contains(r#"{\"a\":1}"#));
        assert!(snippet.contains("credentials: 'include'"));
    }

    #[test]
    fn replay_snippet_get_has_no_body() {
        let snippet = replay_snippet("https://x.test/", "GET", None);
        assert!(snippet.contains("body: undefined"));
    }
}
