//! Batch form filling with native-setter detours so framework-wrapped
//! inputs observe `input`/`change`.

use serde_json::{Value, json};

use crate::error::BrokerError;

use super::primitives::{RESOLVE_SELECTOR_JS, json_string};
use super::{ToolDispatcher, ToolReply, interact};

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let fields = args
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| BrokerError::InvalidParams("fields must be an array".into()))?;

    let mut results = Vec::with_capacity(fields.len());
    let mut all_ok = true;
    for field in fields {
        let selector = field
            .get("selector")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidParams("each field needs a selector".into()))?;
        let outcome = fill_field(d, selector, field).await;
        match outcome {
            Ok(description) => {
                results.push(json!({"selector": selector, "success": true, "filled": description}));
            }
            Err(err) => {
                all_ok = false;
                results.push(json!({
                    "selector": selector,
                    "success": false,
                    "error": err.to_string(),
                }));
            }
        }
    }

    let summary = results
        .iter()
        .map(|r| {
            if r["success"].as_bool().unwrap_or(false) {
                format!("✓ {}", r["selector"].as_str().unwrap_or(""))
            } else {
                format!(
                    "✗ {}: {}",
                    r["selector"].as_str().unwrap_or(""),
                    r["error"].as_str().unwrap_or("")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    Ok(ToolReply::text(
        format!("Filled {} field(s):\n{summary}", fields.len()),
        json!({"success": all_ok, "results": results}),
    ))
}

async fn fill_field(
    d: &ToolDispatcher,
    selector: &str,
    field: &Value,
) -> Result<String, BrokerError> {
    let kind = field
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("text");

    match kind {
        "text" | "textarea" => {
            let value = required_string(field, "value")?;
            let result = d
                .eval(&interact::native_set_value_snippet(selector, value, false))
                .await?;
            expect_ok(&result, selector)?;
            Ok(format!("text ({} chars)", value.len()))
        }
        "checkbox" | "radio" => {
            let checked = field
                .get("checked")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let result = d.eval(&set_checked_snippet(selector, checked)).await?;
            expect_ok(&result, selector)?;
            Ok(format!("{kind} = {checked}"))
        }
        "select" => {
            let values = field_values(field)?;
            let result = d.eval(&select_option_snippet(selector, &values)).await?;
            expect_ok(&result, selector)?;
            Ok(format!("select ({} option(s))", values.len()))
        }
        other => Err(BrokerError::InvalidParams(format!(
            "unsupported field type: {other}"
        ))),
    }
}

fn required_string<'a>(field: &'a Value, key: &str) -> Result<&'a str, BrokerError> {
    field
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams(format!("{key} is required")))
}

fn field_values(field: &Value) -> Result<Vec<String>, BrokerError> {
    match field.get("values") {
        Some(Value::Array(arr)) => Ok(arr
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()),
        _ => Ok(vec![required_string(field, "value")?.to_owned()]),
    }
}

fn expect_ok(result: &Value, selector: &str) -> Result<(), BrokerError> {
    if result.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(())
    } else {
        Err(BrokerError::ElementNotFound {
            selector: selector.to_owned(),
            hints: Vec::new(),
        })
    }
}

/// Checkbox/radio state through the native `checked` setter plus
/// `click`-equivalent events.
fn set_checked_snippet(selector: &str, checked: bool) -> String {
    format!(
        r"(function() {{
{RESOLVE_SELECTOR_JS}
  var el = __resolveSelector({sel});
  if (!el) {{ return {{ok: false}}; }}
  var desc = Object.getOwnPropertyDescriptor(HTMLInputElement.prototype, 'checked');
  if (desc && desc.set) {{ desc.set.call(el, {checked}); }} else {{ el.checked = {checked}; }}
  el.dispatchEvent(new Event('input', {{bubbles: true}}));
  el.dispatchEvent(new Event('change', {{bubbles: true}}));
  return {{ok: true}};
}})()",
        sel = json_string(selector),
        checked = checked,
    )
}

/// Single- and multi-select via the native option `selected` setter;
/// values match against option values first, labels second.
pub(crate) fn select_option_snippet(selector: &str, values: &[String]) -> String {
    let values_json =
        serde_json::to_string(values).unwrap_or_else(|_| "[]".to_owned());
    format!(
        r"(function() {{
{RESOLVE_SELECTOR_JS}
  var el = __resolveSelector({sel});
  if (!el || el.tagName !== 'SELECT') {{ return {{ok: false}}; }}
  var wanted = {values_json};
  var matched = 0;
  for (var i = 0; i < el.options.length; i++) {{
    var opt = el.options[i];
    var hit = wanted.indexOf(opt.value) !== -1 || wanted.indexOf(opt.label) !== -1;
    if (el.multiple) {{
      opt.selected = hit;
      if (hit) {{ matched++; }}
    }} else if (hit) {{
      el.value = opt.value;
      matched = 1;
      break;
    }}
  }}
  if (!matched) {{ return {{ok: false}}; }}
  el.dispatchEvent(new Event('input', {{bubbles: true}}));
  el.dispatchEvent(new Event('change', {{bubbles: true}}));
  return {{ok: true, matched: matched}};
}})()",
        sel = json_string(selector),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_snippet_uses_native_setter() {
        let snippet = set_checked_snippet("#agree", true);
        assert!(snippet.contains("HTMLInputElement.prototype, 'checked'"));
        assert!(snippet.contains("desc.set.call(el, true)"));
    }

    #[test]
    fn select_snippet_embeds_values() {
        let snippet = select_option_snippet("#country", &["DE".to_owned(), "AT".to_owned()]);
        assert!(snippet.contains(r#"["DE","AT"]"#));
        assert!(snippet.contains("el.multiple"));
    }

    #[test]
    fn field_values_accepts_single_and_multi() {
        let single = json!({"value": "x"});
        assert_eq!(field_values(&single).unwrap(), vec!["x"]);
        let multi = json!({"values": ["a", "b"]});
        assert_eq!(field_values(&multi).unwrap(), vec!["a", "b"]);
    }
}
