//! Three-layer defense for agent-supplied JavaScript.
//!
//! Layer 1 screens the source statically on the broker. Layer 2 asks
//! the extension's membrane validator for a pre-flight verdict. Layer 3
//! wraps the source behind a runtime page proxy before it reaches the
//! page. A block at any layer stops the call and names the layer.

pub(crate) mod lexer;
mod screen;
mod wrap;

pub use screen::screen_source;
pub use wrap::{PROXY_BLOCKED_PROPS, wrap_with_page_proxy};

use serde_json::{Value, json};
use tracing::debug;

use crate::error::BrokerError;
use crate::transport::{TransportError, TransportHandle};

/// Run agent code through all three layers and return its value.
///
/// # Errors
///
/// `SecureEvalBlocked` naming the blocking layer, or the underlying
/// transport/peer error for non-secure-eval failures.
pub async fn evaluate_secure(
    transport: &TransportHandle,
    expression: &str,
    await_promise: bool,
) -> Result<Value, BrokerError> {
    // Layer 1: static screen. Nothing is sent anywhere on a block.
    if let Err(reason) = screen_source(expression) {
        return Err(BrokerError::SecureEvalBlocked {
            layer: "ast",
            reason,
        });
    }

    // Layer 2: membrane pre-flight on the extension.
    match transport
        .send_cmd("validateEval", Some(json!({"code": expression})), None)
        .await
    {
        Ok(verdict) => {
            if verdict.get("safe").and_then(Value::as_bool) == Some(false) {
                let reason = verdict
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("membrane validation failed")
                    .to_owned();
                return Err(BrokerError::SecureEvalBlocked {
                    layer: "membrane",
                    reason,
                });
            }
        }
        // An older extension without the validator is a skip, not a
        // block; the remaining layers still stand.
        Err(TransportError::Peer { message }) if is_unknown_method(&message) => {
            debug!("extension lacks validateEval, skipping layer 2");
        }
        Err(e) => return Err(e.into()),
    }

    // Layer 3: runtime page proxy.
    let wrapped = wrap_with_page_proxy(expression);
    let result = transport
        .send_cmd(
            "evaluate",
            Some(json!({
                "code": wrapped,
                "awaitPromise": await_promise,
                "prewrapped": true,
            })),
            None,
        )
        .await;
    match result {
        Ok(value) => Ok(value.get("value").cloned().unwrap_or(value)),
        Err(TransportError::Peer { message }) if message.contains("[secure_eval]") => {
            Err(BrokerError::SecureEvalBlocked {
                layer: "page_proxy",
                reason: message,
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn is_unknown_method(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("unknown method") || lower.contains("method not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_detection() {
        assert!(is_unknown_method("Unknown method: validateEval"));
        assert!(is_unknown_method("method not found"));
        assert!(!is_unknown_method("tab not attached"));
    }
}
