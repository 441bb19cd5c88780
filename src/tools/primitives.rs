//! CDP primitives every tool handler composes: command forwarding,
//! in-page evaluation, selector resolution with `:has-text()` support,
//! and "did-you-mean" alternative discovery.

use serde_json::{Value, json};
use tokio::time::Duration;

use crate::error::BrokerError;
use crate::transport::TransportHandle;

use super::ToolDispatcher;

/// Resolves a selector in page context, including the custom
/// `:has-text("...")` pseudo. Declared once and inlined into every
/// snippet that needs selector resolution.
pub(crate) const RESOLVE_SELECTOR_JS: &str = r#"
function __resolveSelector(selector) {
  var m = selector.match(/^(.*?):has-text\((["'])(.*)\2\)\s*$/);
  if (!m) { return document.querySelector(selector); }
  var base = m[1].trim() || '*';
  var phrase = m[3].toLowerCase();
  var nodes = document.querySelectorAll(base);
  for (var i = 0; i < nodes.length; i++) {
    var el = nodes[i];
    var direct = '';
    for (var c = el.firstChild; c; c = c.nextSibling) {
      if (c.nodeType === 3) { direct += c.textContent; }
    }
    var text = (direct || el.textContent || '').toLowerCase();
    if (text.indexOf(phrase) !== -1) { return el; }
  }
  return null;
}
"#;

impl ToolDispatcher {
    /// Forward one CDP command to the attached tab.
    ///
    /// # Errors
    ///
    /// Transport errors, peer errors, and CDP `exceptionDetails`
    /// (preferring `exception.description` over `text`).
    pub(crate) async fn cdp(&self, method: &str, params: Value) -> Result<Value, BrokerError> {
        self.cdp_with_timeout(method, params, None).await
    }

    pub(crate) async fn cdp_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BrokerError> {
        let result = self
            .transport()
            .send_cmd(
                "cdp",
                Some(json!({"method": method, "params": params})),
                timeout,
            )
            .await
            .map_err(BrokerError::from)?;
        check_exception_details(&result)?;
        Ok(result)
    }

    /// `Runtime.evaluate` with by-value results and a user gesture.
    ///
    /// # Errors
    ///
    /// As [`Self::cdp`]; page exceptions become `Peer` errors.
    pub(crate) async fn eval(&self, expression: &str) -> Result<Value, BrokerError> {
        self.eval_with_options(expression, true).await
    }

    pub(crate) async fn eval_with_options(
        &self,
        expression: &str,
        await_promise: bool,
    ) -> Result<Value, BrokerError> {
        let result = self
            .cdp(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "userGesture": true,
                    "awaitPromise": await_promise,
                }),
            )
            .await?;
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Cooperative delay between composed steps.
    pub(crate) async fn sleep(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Resolve a selector to its bounding-rect center.
    ///
    /// # Errors
    ///
    /// `ElementNotFound` with did-you-mean hints when the selector
    /// misses.
    pub(crate) async fn get_element_center(
        &self,
        selector: &str,
    ) -> Result<(f64, f64), BrokerError> {
        let snippet = format!(
            r"(function() {{
{RESOLVE_SELECTOR_JS}
  var el = __resolveSelector({selector_json});
  if (!el) {{ return null; }}
  var rect = el.getBoundingClientRect();
  return {{ x: rect.left + rect.width / 2, y: rect.top + rect.height / 2 }};
}})()",
            selector_json = json_string(selector),
        );
        let value = self.eval(&snippet).await?;
        if value.is_null() {
            let hints = find_alternatives(self.transport(), selector).await;
            return Err(BrokerError::ElementNotFound {
                selector: selector.to_owned(),
                hints,
            });
        }
        let x = value.get("x").and_then(Value::as_f64).unwrap_or(0.0);
        let y = value.get("y").and_then(Value::as_f64).unwrap_or(0.0);
        Ok((x, y))
    }
}

/// When a `:has-text()` selector misses, scan the page for elements
/// whose direct text contains the phrase and synthesize selectors for
/// up to 3 visible and 2 hidden candidates.
pub async fn find_alternatives(transport: &TransportHandle, selector: &str) -> Vec<String> {
    let Some(phrase) = has_text_phrase(selector) else {
        return Vec::new();
    };
    let snippet = format!(
        r"(function() {{
  var phrase = {phrase_json}.toLowerCase();
  var visible = [], hidden = [];
  var all = document.querySelectorAll('*');
  for (var i = 0; i < all.length; i++) {{
    var el = all[i];
    var direct = '';
    for (var c = el.firstChild; c; c = c.nextSibling) {{
      if (c.nodeType === 3) {{ direct += c.textContent; }}
    }}
    if (direct.toLowerCase().indexOf(phrase) === -1) {{ continue; }}
    var style = window.getComputedStyle(el);
    var rect = el.getBoundingClientRect();
    var isVisible = style.display !== 'none' && style.visibility !== 'hidden'
      && style.opacity !== '0' && rect.width > 0 && rect.height > 0;
    var sel;
    if (el.id) {{ sel = '#' + el.id; }}
    else if (el.classList.length) {{
      sel = el.tagName.toLowerCase() + '.' + el.classList[0];
    }} else {{
      var tag = el.tagName.toLowerCase();
      var n = 1, sib = el;
      while ((sib = sib.previousElementSibling)) {{
        if (sib.tagName === el.tagName) {{ n++; }}
      }}
      sel = tag + ':nth-of-type(' + n + ')';
    }}
    if (isVisible && visible.length < 3) {{ visible.push(sel); }}
    else if (!isVisible && hidden.length < 2) {{ hidden.push(sel + ' (hidden)'); }}
    if (visible.length >= 3 && hidden.length >= 2) {{ break; }}
  }}
  return visible.concat(hidden);
}})()",
        phrase_json = json_string(&phrase),
    );
    let result = transport
        .send_cmd(
            "cdp",
            Some(json!({
                "method": "Runtime.evaluate",
                "params": {
                    "expression": snippet,
                    "returnByValue": true,
                    "userGesture": false,
                    "awaitPromise": false,
                },
            })),
            None,
        )
        .await;
    match result {
        Ok(value) => value
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        // Hints are best-effort; a failed scan just yields none.
        Err(_) => Vec::new(),
    }
}

/// Extract the phrase out of a `:has-text("...")` selector, if present.
pub(crate) fn has_text_phrase(selector: &str) -> Option<String> {
    let start = selector.find(":has-text(")?;
    let rest = &selector[start + ":has-text(".len()..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_owned())
}

/// Serialize a string as a JSON literal for embedding into snippets.
pub(crate) fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

/// Raise CDP `exceptionDetails` as an error, preferring the exception's
/// `description` over the generic `text`.
pub(crate) fn check_exception_details(result: &Value) -> Result<(), BrokerError> {
    let Some(details) = result.get("exceptionDetails") else {
        return Ok(());
    };
    let message = details
        .get("exception")
        .and_then(|e| e.get("description"))
        .and_then(Value::as_str)
        .or_else(|| details.get("text").and_then(Value::as_str))
        .unwrap_or("evaluation failed")
        .to_owned();
    Err(BrokerError::Peer { message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_text_phrase_double_quotes() {
        assert_eq!(
            has_text_phrase(r#"button:has-text("Submit")"#).as_deref(),
            Some("Submit")
        );
    }

    #[test]
    fn has_text_phrase_single_quotes() {
        assert_eq!(
            has_text_phrase("a:has-text('Sign in')").as_deref(),
            Some("Sign in")
        );
    }

    #[test]
    fn has_text_phrase_absent() {
        assert!(has_text_phrase("button.cta").is_none());
    }

    #[test]
    fn json_string_escapes() {
        assert_eq!(json_string(r#"a"b"#), r#""a\"b""#);
    }

    #[test]
    fn exception_details_prefers_description() {
        let result = serde_json::json!({
            "exceptionDetails": {
                "text": "Uncaught",
                "exception": {"description": "TypeError: x is not a function"},
            }
        });
        let err = check_exception_details(&result).unwrap_err();
        assert!(err.to_string().contains("TypeError"));
    }

    #[test]
    fn exception_details_falls_back_to_text() {
        let result = serde_json::json!({
            "exceptionDetails": {"text": "Uncaught SyntaxError"}
        });
        let err = check_exception_details(&result).unwrap_err();
        assert!(err.to_string().contains("SyntaxError"));
    }

    #[test]
    fn no_exception_is_ok() {
        assert!(check_exception_details(&serde_json::json!({"result": {}})).is_ok());
    }
}
