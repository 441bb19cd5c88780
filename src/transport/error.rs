use std::fmt;

/// Errors that can occur on the broker/extension wire.
#[derive(Debug)]
pub enum TransportError {
    /// The OS refused the bind because the port is taken.
    PortInUse(u16),

    /// The listener could not be created for another reason.
    Bind(String),

    /// No peer is connected, or the peer went away while the request was
    /// in flight.
    Disconnected,

    /// The peer did not answer within the request's deadline.
    Timeout {
        /// The method that timed out.
        method: String,
    },

    /// The peer answered with an error payload.
    Peer {
        /// The peer's error message, verbatim.
        message: String,
    },

    /// The transport task is not running (stopped or never started).
    Stopped,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortInUse(port) => write!(f, "port {port} already in use"),
            Self::Bind(msg) => write!(f, "bind failed: {msg}"),
            Self::Disconnected => write!(f, "extension disconnected"),
            Self::Timeout { method } => write!(f, "request timed out: {method}"),
            Self::Peer { message } => write!(f, "peer error: {message}"),
            Self::Stopped => write!(f, "transport is not running"),
        }
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_port_in_use() {
        assert_eq!(
            TransportError::PortInUse(5555).to_string(),
            "port 5555 already in use"
        );
    }

    #[test]
    fn display_timeout_names_method() {
        let err = TransportError::Timeout {
            method: "capturePageState".into(),
        };
        assert_eq!(err.to_string(), "request timed out: capturePageState");
    }

    #[test]
    fn display_peer_carries_message() {
        let err = TransportError::Peer {
            message: "tab not found".into(),
        };
        assert_eq!(err.to_string(), "peer error: tab not found");
    }

    #[test]
    fn error_trait_is_implemented() {
        let err: &dyn std::error::Error = &TransportError::Disconnected;
        assert!(err.source().is_none());
    }
}
