//! Navigation: direct URL loads via CDP, history moves via in-page
//! eval followed by a settle wait.

use serde_json::{Value, json};

use crate::error::BrokerError;

use super::{ToolDispatcher, ToolReply, wait};

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    if let Some(url) = args.get("url").and_then(Value::as_str) {
        return navigate_to(d, url).await;
    }
    let action = args
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("url or action is required".into()))?;
    match action {
        "back" => history_move(d, "history.back()", "Went back").await,
        "forward" => history_move(d, "history.forward()", "Went forward").await,
        "reload" => reload(d).await,
        other => Err(BrokerError::UnknownAction {
            tool: "browser_navigate",
            action: other.to_owned(),
        }),
    }
}

async fn navigate_to(d: &ToolDispatcher, url: &str) -> Result<ToolReply, BrokerError> {
    let result = d.cdp("Page.navigate", json!({"url": url})).await?;
    if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
        return Err(BrokerError::Peer {
            message: format!("navigation failed: {error_text}"),
        });
    }
    wait::settle_after_navigation(d).await;
    let current = current_url(d).await;
    Ok(ToolReply::json(
        &format!("Navigated to {}.", current.as_deref().unwrap_or(url)),
        json!({"success": true, "url": current.unwrap_or_else(|| url.to_owned())}),
    ))
}

/// History moves run in page context; CDP has no direct equivalent that
/// works without a frame id round-trip.
async fn history_move(
    d: &ToolDispatcher,
    script: &str,
    verb: &str,
) -> Result<ToolReply, BrokerError> {
    d.eval(script).await?;
    wait::settle_after_navigation(d).await;
    let current = current_url(d).await;
    Ok(ToolReply::json(
        &format!("{verb} to {}.", current.as_deref().unwrap_or("(unknown)")),
        json!({"success": true, "url": current}),
    ))
}

async fn reload(d: &ToolDispatcher) -> Result<ToolReply, BrokerError> {
    d.cdp("Page.reload", json!({})).await?;
    wait::settle_after_navigation(d).await;
    let current = current_url(d).await;
    Ok(ToolReply::json(
        "Reloaded.",
        json!({"success": true, "url": current}),
    ))
}

async fn current_url(d: &ToolDispatcher) -> Option<String> {
    d.eval("window.location.href")
        .await
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
}
