use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound JSON-RPC request (broker to extension).
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// 8-character random correlation id.
    pub id: String,
    /// Command name the extension router dispatches on.
    pub method: String,
    /// Parameters for the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Outbound JSON-RPC notification (either direction, no id).
#[derive(Debug, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Error payload carried in a JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerErrorPayload {
    /// Human-readable error description.
    pub message: String,
    /// Peer-side stack trace, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Outbound JSON-RPC response (extension router to broker; also used by
/// the broker for the single-peer rejection envelope).
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// One-time handshake frame sent by the extension after the upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Browser family, e.g. `"Chrome"`.
    pub browser: String,
    /// Extension version string.
    pub version: String,
    /// Build timestamp of the extension bundle, when known.
    #[serde(rename = "buildTimestamp")]
    pub build_timestamp: Option<String>,
}

/// The tab record pushed by the extension alongside tab operations and
/// `notifications/tab_info_update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabRecord {
    #[serde(rename = "tabId")]
    pub tab_id: i64,
    pub index: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Detected frameworks/libraries, when the extension has probed them.
    #[serde(rename = "techStack", skip_serializing_if = "Option::is_none")]
    pub tech_stack: Option<Vec<String>>,
    /// Whether stealth mode is active for this tab.
    #[serde(default)]
    pub stealth: bool,
}

/// Raw incoming frame before classification.
///
/// The union of response, notification, and handshake fields. Every
/// incoming text frame is deserialized into this first, then classified.
#[derive(Debug, Deserialize)]
pub struct RawFrame {
    pub id: Option<String>,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<PeerErrorPayload>,
    /// `"handshake"` for the one-time peer announcement.
    #[serde(rename = "type")]
    pub frame_type: Option<String>,
    pub browser: Option<String>,
    pub version: Option<String>,
    #[serde(rename = "buildTimestamp")]
    pub build_timestamp: Option<String>,
}

/// Classification of a raw incoming frame.
#[derive(Debug)]
pub enum FrameKind {
    /// A response to a previously sent request.
    Response {
        id: String,
        result: Result<Value, PeerErrorPayload>,
    },
    /// The peer's one-time handshake announcement.
    Handshake(Handshake),
    /// An uncorrelated notification.
    Notification { method: String, params: Value },
}

impl RawFrame {
    /// Classify this frame.
    ///
    /// Frames with an `id` and no `method` are responses; `type:
    /// "handshake"` frames are the peer announcement; `method` without
    /// `id` is a notification. Returns `None` for anything else
    /// (malformed frames are logged and dropped by the caller).
    #[must_use]
    pub fn classify(self) -> Option<FrameKind> {
        if self.frame_type.as_deref() == Some("handshake") {
            return Some(FrameKind::Handshake(Handshake {
                browser: self.browser.unwrap_or_else(|| "unknown".to_owned()),
                version: self.version.unwrap_or_else(|| "unknown".to_owned()),
                build_timestamp: self.build_timestamp,
            }));
        }
        match (self.id, self.method) {
            (Some(id), None) => {
                let result = match self.error {
                    Some(err) => Err(err),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                Some(FrameKind::Response { id, result })
            }
            (None, Some(method)) => Some(FrameKind::Notification {
                method,
                params: self.params.unwrap_or(Value::Null),
            }),
            _ => None,
        }
    }
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate an 8-character opaque request id.
///
/// Ids only need to be unique within one peer-connection lifetime; the
/// pending map rejects would-be duplicates by construction (62^8 space).
#[must_use]
pub fn new_request_id() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let idx = rng.gen_range(0..ID_ALPHABET.len());
            ID_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request_without_params() {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: "abc12345".into(),
            method: "capturePageState".into(),
            params: None,
        };
        let v: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], "abc12345");
        assert!(v.get("params").is_none());
    }

    #[test]
    fn classify_success_response() {
        let raw: RawFrame =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"aaaa1111","result":{"ok":true}}"#)
                .unwrap();
        match raw.classify() {
            Some(FrameKind::Response { id, result }) => {
                assert_eq!(id, "aaaa1111");
                assert_eq!(result.unwrap()["ok"], true);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_error_response() {
        let raw: RawFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"bbbb2222","error":{"message":"tab not found"}}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(FrameKind::Response { result, .. }) => {
                assert_eq!(result.unwrap_err().message, "tab not found");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_handshake() {
        let raw: RawFrame = serde_json::from_str(
            r#"{"type":"handshake","browser":"Chrome","version":"1.4.0","buildTimestamp":"2026-07-01T12:34:56Z"}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(FrameKind::Handshake(hs)) => {
                assert_eq!(hs.browser, "Chrome");
                assert_eq!(hs.build_timestamp.as_deref(), Some("2026-07-01T12:34:56Z"));
            }
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let raw: RawFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/tab_info_update","params":{"tabId":3}}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(FrameKind::Notification { method, params }) => {
                assert_eq!(method, "notifications/tab_info_update");
                assert_eq!(params["tabId"], 3);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classify_unclassifiable_returns_none() {
        let raw: RawFrame = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert!(raw.classify().is_none());
    }

    #[test]
    fn classify_response_without_result_yields_null() {
        let raw: RawFrame = serde_json::from_str(r#"{"id":"cccc3333"}"#).unwrap();
        match raw.classify() {
            Some(FrameKind::Response { result, .. }) => {
                assert_eq!(result.unwrap(), Value::Null);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn request_ids_are_8_chars_and_vary() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        // Collisions in a 62^8 space across two draws would indicate a
        // broken generator.
        assert_ne!(a, b);
    }

    #[test]
    fn tab_record_roundtrip() {
        let tab: TabRecord = serde_json::from_value(json!({
            "tabId": 7,
            "index": 0,
            "title": "Example",
            "url": "https://example.com",
            "techStack": ["React", "Tailwind"],
        }))
        .unwrap();
        assert_eq!(tab.tab_id, 7);
        assert_eq!(tab.tech_stack.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn tab_record_tolerates_missing_fields() {
        let tab: TabRecord = serde_json::from_value(json!({"tabId": 1, "index": 2})).unwrap();
        assert_eq!(tab.title, "");
        assert!(tab.tech_stack.is_none());
    }
}
