//! JavaScript evaluation in the attached tab, routed through the
//! secure-eval pipeline when that experiment is on.

use serde_json::{Value, json};

use crate::error::BrokerError;
use crate::experiments;
use crate::secure_eval;

use super::{ToolDispatcher, ToolReply};

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let expression = args
        .get("expression")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("expression is required".into()))?;
    let await_promise = args
        .get("await_promise")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let value = if experiments::registry().is_enabled("secure_eval") {
        secure_eval::evaluate_secure(d.transport(), expression, await_promise).await?
    } else {
        d.eval_with_options(expression, await_promise).await?
    };

    let rendered = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    Ok(ToolReply::text(
        format!("Result:\n{rendered}"),
        json!({"success": true, "result": value}),
    ))
}
