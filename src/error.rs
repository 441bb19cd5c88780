use std::fmt;

use serde_json::{Value, json};

use crate::transport::TransportError;

/// Errors surfaced by tool handlers and the connection manager.
///
/// Kinds map one-to-one onto the broker's error taxonomy; the snake_case
/// code is what raw (script-mode) callers see in the `error` field.
#[derive(Debug)]
pub enum BrokerError {
    /// `enable` was called without a usable `client_id`.
    MissingClientId,

    /// The listening port is already bound by another process.
    PortInUse(u16),

    /// The listener could not be created for a reason other than a port
    /// collision.
    BindFailure(String),

    /// No extension peer is connected (or it went away mid-request).
    Disconnected,

    /// A request to the extension did not complete within its deadline.
    Timeout {
        /// The broker-to-extension method that timed out.
        method: String,
    },

    /// The extension answered with an error payload.
    Peer {
        /// The peer's error message, verbatim.
        message: String,
    },

    /// A selector did not resolve to any element.
    ElementNotFound {
        /// The selector as given by the caller.
        selector: String,
        /// "Did you mean" suggestions synthesized from the page.
        hints: Vec<String>,
    },

    /// Agent-supplied code was rejected by the secure-eval pipeline.
    SecureEvalBlocked {
        /// Which layer blocked: `ast`, `membrane`, or `page_proxy`.
        layer: &'static str,
        /// Human-readable reason, including the offending pattern.
        reason: String,
    },

    /// Another debugger (DevTools or extension) holds the tab.
    DebuggerConflict {
        /// The underlying error message from the browser.
        message: String,
    },

    /// The requested tool name is not registered.
    UnknownTool(String),

    /// A tool was called with an action outside its closed action set.
    UnknownAction {
        /// The tool the action was sent to.
        tool: &'static str,
        /// The unrecognized action.
        action: String,
    },

    /// An experiment toggle named an experiment outside the catalog.
    UnknownExperiment(String),

    /// A browser tool was called while the connection is disabled.
    NotEnabled,

    /// The tool's parameter object failed validation.
    InvalidParams(String),

    /// Local I/O failed (screenshot/PDF file save, config write).
    Io(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingClientId => {
                write!(f, "enable requires a non-empty client_id")
            }
            Self::PortInUse(port) => {
                write!(f, "port {port} is already in use by another process")
            }
            Self::BindFailure(msg) => write!(f, "failed to start listener: {msg}"),
            Self::Disconnected => write!(f, "no browser extension connected"),
            Self::Timeout { method } => {
                write!(f, "extension request timed out: {method}")
            }
            Self::Peer { message } => write!(f, "extension error: {message}"),
            Self::ElementNotFound { selector, hints } => {
                if hints.is_empty() {
                    write!(f, "no element matches selector: {selector}")
                } else {
                    write!(
                        f,
                        "no element matches selector: {selector}. Did you mean: {}",
                        hints.join(", ")
                    )
                }
            }
            Self::SecureEvalBlocked { layer, reason } => {
                write!(f, "secure_eval [{layer}] {reason}")
            }
            Self::DebuggerConflict { message } => {
                write!(
                    f,
                    "{message}. Another debugger is attached to this tab; close DevTools \
                     or detach the other extension, then retry"
                )
            }
            Self::UnknownTool(name) => write!(f, "unknown tool: {name}"),
            Self::UnknownAction { tool, action } => {
                write!(f, "{tool}: unknown action: {action}")
            }
            Self::UnknownExperiment(name) => {
                write!(f, "unknown experiment: {name}")
            }
            Self::NotEnabled => {
                write!(
                    f,
                    "browser connection is not enabled; call the enable tool with a client_id first"
                )
            }
            Self::InvalidParams(msg) => write!(f, "invalid parameters: {msg}"),
            Self::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl BrokerError {
    /// Stable snake_case code used by raw (script-mode) error payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingClientId => "missing_client_id",
            Self::PortInUse(_) => "port_in_use",
            Self::BindFailure(_) => "connection_failed",
            Self::Disconnected => "disconnected",
            Self::Timeout { .. } => "timeout",
            Self::Peer { .. } => "peer_error",
            Self::ElementNotFound { .. } => "element_not_found",
            Self::SecureEvalBlocked { .. } => "secure_eval_blocked",
            Self::DebuggerConflict { .. } => "debugger_conflict",
            Self::UnknownTool(_) => "unknown_tool",
            Self::UnknownAction { .. } => "unknown_action",
            Self::UnknownExperiment(_) => "unknown_experiment",
            Self::NotEnabled => "not_enabled",
            Self::InvalidParams(_) => "invalid_params",
            Self::Io(_) => "io_error",
        }
    }

    /// Raw-mode error payload: `{success:false, error, message}`.
    #[must_use]
    pub fn to_raw(&self) -> Value {
        json!({
            "success": false,
            "error": self.code(),
            "message": self.to_string(),
        })
    }
}

/// Classify a peer error message, promoting debugger-attachment conflicts
/// to `DebuggerConflict` so the caller gets remediation hints.
#[must_use]
pub fn classify_peer_error(message: String) -> BrokerError {
    let lower = message.to_lowercase();
    let debugger_related = ["debugger", "attach", "session"]
        .iter()
        .any(|needle| lower.contains(needle));
    let conflict_related = ["another", "conflict", "denied"]
        .iter()
        .any(|needle| lower.contains(needle));
    if debugger_related && conflict_related {
        BrokerError::DebuggerConflict { message }
    } else {
        BrokerError::Peer { message }
    }
}

impl From<TransportError> for BrokerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PortInUse(port) => Self::PortInUse(port),
            TransportError::Bind(msg) => Self::BindFailure(msg),
            TransportError::Disconnected | TransportError::Stopped => Self::Disconnected,
            TransportError::Timeout { method } => Self::Timeout { method },
            TransportError::Peer { message } => classify_peer_error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_missing_client_id() {
        assert_eq!(
            BrokerError::MissingClientId.to_string(),
            "enable requires a non-empty client_id"
        );
    }

    #[test]
    fn display_element_not_found_with_hints() {
        let err = BrokerError::ElementNotFound {
            selector: "button:has-text(\"Submit\")".into(),
            hints: vec!["button.cta".into(), "#send".into()],
        };
        let text = err.to_string();
        assert!(text.contains("button:has-text"));
        assert!(text.contains("Did you mean: button.cta, #send"));
    }

    #[test]
    fn display_element_not_found_without_hints() {
        let err = BrokerError::ElementNotFound {
            selector: "#gone".into(),
            hints: vec![],
        };
        assert!(!err.to_string().contains("Did you mean"));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(BrokerError::MissingClientId.code(), "missing_client_id");
        assert_eq!(BrokerError::PortInUse(5555).code(), "port_in_use");
        assert_eq!(BrokerError::Disconnected.code(), "disconnected");
        assert_eq!(
            BrokerError::UnknownExperiment("x".into()).code(),
            "unknown_experiment"
        );
    }

    #[test]
    fn raw_payload_shape() {
        let raw = BrokerError::MissingClientId.to_raw();
        assert_eq!(raw["success"], false);
        assert_eq!(raw["error"], "missing_client_id");
        assert!(raw["message"].as_str().is_some());
    }

    #[test]
    fn classify_debugger_conflict() {
        let err = classify_peer_error("Another debugger is already attached".into());
        assert!(matches!(err, BrokerError::DebuggerConflict { .. }));
    }

    #[test]
    fn classify_requires_both_pattern_halves() {
        // "debugger" without a conflict word stays a plain peer error.
        let err = classify_peer_error("debugger detached unexpectedly".into());
        assert!(matches!(err, BrokerError::Peer { .. }));
        // Conflict word without a debugger word likewise.
        let err = classify_peer_error("permission denied by policy".into());
        assert!(matches!(err, BrokerError::Peer { .. }));
    }

    #[test]
    fn transport_error_conversion() {
        let err: BrokerError = TransportError::Timeout {
            method: "cdp".into(),
        }
        .into();
        assert!(matches!(err, BrokerError::Timeout { .. }));

        let err: BrokerError = TransportError::PortInUse(5555).into();
        assert!(matches!(err, BrokerError::PortInUse(5555)));
    }
}
