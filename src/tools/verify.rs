//! Assertions over page state. Failed assertions are framed as
//! `isError` results, not hard errors.

use serde_json::{Value, json};

use crate::error::BrokerError;

use super::primitives::{RESOLVE_SELECTOR_JS, json_string};
use super::{ToolDispatcher, ToolReply};

pub async fn text_visible(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let text = args
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("text is required".into()))?;

    let snippet = format!(
        r"(function() {{
  var phrase = {phrase}.toLowerCase();
  var all = document.querySelectorAll('*');
  for (var i = 0; i < all.length; i++) {{
    var el = all[i];
    if ((el.textContent || '').toLowerCase().indexOf(phrase) === -1) {{ continue; }}
    var style = window.getComputedStyle(el);
    var rect = el.getBoundingClientRect();
    if (style.display !== 'none' && style.visibility !== 'hidden'
        && style.opacity !== '0' && rect.width > 0 && rect.height > 0) {{
      return true;
    }}
  }}
  return false;
}})()",
        phrase = json_string(text),
    );
    let visible = d.eval(&snippet).await? == Value::Bool(true);
    if visible {
        Ok(ToolReply::json(
            &format!("Text \"{text}\" is visible."),
            json!({"success": true, "visible": true}),
        ))
    } else {
        Ok(ToolReply::assertion_failure(
            format!("Text \"{text}\" is NOT visible on the page."),
            json!({"success": false, "visible": false}),
        ))
    }
}

pub async fn element_visible(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let selector = args
        .get("selector")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("selector is required".into()))?;

    let snippet = format!(
        r"(function() {{
{RESOLVE_SELECTOR_JS}
  var el = __resolveSelector({sel});
  if (!el) {{ return {{found: false, visible: false}}; }}
  var style = window.getComputedStyle(el);
  var rect = el.getBoundingClientRect();
  var visible = style.display !== 'none' && style.visibility !== 'hidden'
    && style.opacity !== '0' && rect.width > 0 && rect.height > 0;
  return {{found: true, visible: visible}};
}})()",
        sel = json_string(selector),
    );
    let result = d.eval(&snippet).await?;
    let found = result.get("found").and_then(Value::as_bool) == Some(true);
    let visible = result.get("visible").and_then(Value::as_bool) == Some(true);

    if visible {
        Ok(ToolReply::json(
            &format!("Element {selector} is visible."),
            json!({"success": true, "found": true, "visible": true}),
        ))
    } else {
        let detail = if found {
            "present but not visible"
        } else {
            "not found"
        };
        Ok(ToolReply::assertion_failure(
            format!("Element {selector} is {detail}."),
            json!({"success": false, "found": found, "visible": false}),
        ))
    }
}
