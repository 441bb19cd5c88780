//! High-level browser tools, each a composition of CDP primitives
//! dispatched through the transport to the extension router.

mod console;
mod diff;
mod dom;
mod evaluate;
mod extract;
mod forms;
mod interact;
mod misc;
mod navigate;
mod network;
mod primitives;
mod screenshot;
mod tabs;
mod verify;
mod wait;

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use serde_json::{Value, json};
use tokio::time::Duration;

use crate::error::BrokerError;
use crate::humanize::Personality;
use crate::manager::ConnectionManager;
use crate::transport::TransportHandle;

pub use diff::{PageStateSnapshot, SnapshotDiff, calculate_confidence, diff_snapshots, render_diff};
pub use primitives::find_alternatives;
pub(crate) use interact::native_set_value_snippet;

/// Per-request timeout for slow captures (screenshot, PDF).
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Inline screenshots larger than this on either axis are downscaled.
pub const MAX_INLINE_DIMENSION: u32 = 2000;

/// Advertised metadata for one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Inline image content for framed responses.
#[derive(Debug, Clone)]
pub struct ImageContent {
    /// Base64 payload.
    pub data: String,
    pub mime_type: String,
}

/// The dual-mode result of a tool handler: human-readable text for
/// framed callers, structured data for raw callers.
#[derive(Debug)]
pub struct ToolReply {
    pub text: String,
    pub data: Value,
    pub image: Option<ImageContent>,
    /// Framed responses carry `isError: true` (verify tools use this for
    /// failed assertions without raising a hard error).
    pub is_error: bool,
}

impl ToolReply {
    /// A reply whose framed text is a summary line plus the pretty
    /// payload.
    #[must_use]
    pub fn json(summary: &str, data: Value) -> Self {
        let pretty = serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string());
        Self {
            text: format!("{summary}\n{pretty}"),
            data,
            image: None,
            is_error: false,
        }
    }

    /// A reply whose framed text IS the payload (snapshots, markdown).
    #[must_use]
    pub fn text(text: impl Into<String>, data: Value) -> Self {
        Self {
            text: text.into(),
            data,
            image: None,
            is_error: false,
        }
    }

    /// A failed assertion: not a hard error, but framed `isError`.
    #[must_use]
    pub fn assertion_failure(text: impl Into<String>, data: Value) -> Self {
        Self {
            text: text.into(),
            data,
            image: None,
            is_error: true,
        }
    }

    #[must_use]
    pub fn with_image(mut self, data: String, mime_type: &str) -> Self {
        self.image = Some(ImageContent {
            data,
            mime_type: mime_type.to_owned(),
        });
        self
    }
}

/// Dispatches tool calls to their handlers.
///
/// Holds the transport handle and a weak reference back to the manager
/// (the manager owns the dispatcher; the back-reference exists for tab
/// bookkeeping and style-derived flags).
pub struct ToolDispatcher {
    transport: TransportHandle,
    manager: Weak<ConnectionManager>,
    /// Last known cursor position per tab, for humanized motion paths.
    cursor: Mutex<HashMap<i64, (f64, f64)>>,
    /// Lazily drawn per-session motion personality.
    personality: Mutex<Option<Personality>>,
}

impl ToolDispatcher {
    #[must_use]
    pub fn new(transport: TransportHandle, manager: Weak<ConnectionManager>) -> Self {
        Self {
            transport,
            manager,
            cursor: Mutex::new(HashMap::new()),
            personality: Mutex::new(None),
        }
    }

    pub(crate) fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub(crate) fn manager(&self) -> Option<std::sync::Arc<ConnectionManager>> {
        self.manager.upgrade()
    }

    /// Current cursor position for a tab, defaulting to the origin.
    pub(crate) fn cursor_position(&self, tab_id: i64) -> (f64, f64) {
        self.cursor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&tab_id)
            .copied()
            .unwrap_or((0.0, 0.0))
    }

    pub(crate) fn set_cursor_position(&self, tab_id: i64, pos: (f64, f64)) {
        self.cursor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(tab_id, pos);
    }

    /// The session's motion personality, drawn on first use.
    pub(crate) fn personality(&self) -> Personality {
        let mut guard = self
            .personality
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard.get_or_insert_with(|| Personality::random(&mut rand::thread_rng()))
    }

    /// Whether `name` belongs to the dispatcher's tool surface.
    #[must_use]
    pub fn knows(name: &str) -> bool {
        Self::tool_specs().iter().any(|spec| spec.name == name)
    }

    /// Route one tool call.
    ///
    /// # Errors
    ///
    /// `UnknownTool` for names outside the surface; otherwise whatever
    /// the handler raises.
    pub async fn dispatch(&self, name: &str, args: &Value) -> Result<ToolReply, BrokerError> {
        match name {
            "browser_tabs" => tabs::run(self, args).await,
            "browser_navigate" => navigate::run(self, args).await,
            "browser_interact" => interact::run(self, args).await,
            "browser_snapshot" => dom::snapshot(self, args).await,
            "browser_lookup" => dom::lookup(self, args).await,
            "browser_extract_content" => extract::run(self, args).await,
            "browser_get_element_styles" => dom::element_styles(self, args).await,
            "browser_take_screenshot" => screenshot::run(self, args).await,
            "browser_evaluate" => evaluate::run(self, args).await,
            "browser_console_messages" => console::run(self, args).await,
            "browser_network_requests" => network::run(self, args).await,
            "browser_verify_text_visible" => verify::text_visible(self, args).await,
            "browser_verify_element_visible" => verify::element_visible(self, args).await,
            "browser_fill_form" => forms::run(self, args).await,
            "browser_drag" => misc::drag(self, args).await,
            "browser_pdf_save" => misc::pdf_save(self, args).await,
            "browser_list_extensions" => misc::list_extensions(self, args).await,
            "browser_window" => misc::window(self, args).await,
            "browser_handle_dialog" => misc::handle_dialog(self, args).await,
            "browser_performance_metrics" => misc::performance_metrics(self, args).await,
            "browser_secure_fill" => misc::secure_fill(self, args).await,
            _ => Err(BrokerError::UnknownTool(name.to_owned())),
        }
    }

    /// Specs for the browser tools (the manager prepends its own
    /// connection-control specs).
    #[must_use]
    pub fn tool_specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "browser_tabs",
                description: "List, open, attach to, or close browser tabs",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["list", "new", "attach", "close"]},
                        "url": {"type": "string"},
                        "tab_id": {"type": "integer"},
                    },
                    "required": ["action"],
                }),
            },
            ToolSpec {
                name: "browser_navigate",
                description: "Navigate the attached tab to a URL, or go back/forward/reload",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"},
                        "action": {"type": "string", "enum": ["back", "forward", "reload"]},
                    },
                }),
            },
            ToolSpec {
                name: "browser_interact",
                description: "Run a sequence of page interactions (click, type, scroll, ...)",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "actions": {"type": "array", "items": {"type": "object"}},
                        "on_error": {"type": "string", "enum": ["stop", "ignore"]},
                    },
                    "required": ["actions"],
                }),
            },
            ToolSpec {
                name: "browser_snapshot",
                description: "Accessibility-tree snapshot of the attached tab",
                input_schema: json!({"type": "object", "properties": {}}),
            },
            ToolSpec {
                name: "browser_lookup",
                description: "Find elements by visible text content",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "limit": {"type": "integer"},
                    },
                    "required": ["text"],
                }),
            },
            ToolSpec {
                name: "browser_extract_content",
                description: "Extract the page's main content as markdown",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "selector": {"type": "string"},
                        "offset": {"type": "integer"},
                        "max_lines": {"type": "integer"},
                    },
                }),
            },
            ToolSpec {
                name: "browser_get_element_styles",
                description: "Matched CSS rules for an element, with override markers",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "selector": {"type": "string"},
                        "pseudo_state": {"type": "string", "enum": ["hover", "focus", "active", "visited"]},
                        "property_filter": {"type": "string"},
                    },
                    "required": ["selector"],
                }),
            },
            ToolSpec {
                name: "browser_take_screenshot",
                description: "Capture the viewport, full page, a clip rect, or one element",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "full_page": {"type": "boolean"},
                        "selector": {"type": "string"},
                        "clip": {"type": "object"},
                        "file_path": {"type": "string"},
                        "quality": {"type": "integer"},
                        "outline_clickable": {"type": "boolean"},
                    },
                }),
            },
            ToolSpec {
                name: "browser_evaluate",
                description: "Evaluate JavaScript in the attached tab",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "expression": {"type": "string"},
                        "await_promise": {"type": "boolean"},
                    },
                    "required": ["expression"],
                }),
            },
            ToolSpec {
                name: "browser_console_messages",
                description: "List or clear captured console messages",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["list", "clear"]},
                        "level": {"type": "string"},
                        "filter": {"type": "string"},
                        "offset": {"type": "integer"},
                        "limit": {"type": "integer"},
                    },
                }),
            },
            ToolSpec {
                name: "browser_network_requests",
                description: "List, inspect, replay, or clear captured network requests",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["list", "details", "replay", "clear"]},
                        "request_id": {"type": "string"},
                        "filter": {"type": "string"},
                        "offset": {"type": "integer"},
                        "limit": {"type": "integer"},
                    },
                }),
            },
            ToolSpec {
                name: "browser_verify_text_visible",
                description: "Assert that text is visible on the page",
                input_schema: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"],
                }),
            },
            ToolSpec {
                name: "browser_verify_element_visible",
                description: "Assert that a selector resolves to a visible element",
                input_schema: json!({
                    "type": "object",
                    "properties": {"selector": {"type": "string"}},
                    "required": ["selector"],
                }),
            },
            ToolSpec {
                name: "browser_fill_form",
                description: "Fill multiple form fields in one pass",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "fields": {"type": "array", "items": {"type": "object"}},
                    },
                    "required": ["fields"],
                }),
            },
            ToolSpec {
                name: "browser_drag",
                description: "Drag from one element or point to another",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "from": {"type": "string"},
                        "to": {"type": "string"},
                    },
                    "required": ["from", "to"],
                }),
            },
            ToolSpec {
                name: "browser_pdf_save",
                description: "Print the page to a PDF file",
                input_schema: json!({
                    "type": "object",
                    "properties": {"file_path": {"type": "string"}},
                    "required": ["file_path"],
                }),
            },
            ToolSpec {
                name: "browser_list_extensions",
                description: "List installed browser extensions",
                input_schema: json!({"type": "object", "properties": {}}),
            },
            ToolSpec {
                name: "browser_window",
                description: "Resize, minimize, maximize, or query the browser window",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["resize", "maximize", "minimize", "fullscreen", "bounds"]},
                        "width": {"type": "integer"},
                        "height": {"type": "integer"},
                    },
                    "required": ["action"],
                }),
            },
            ToolSpec {
                name: "browser_handle_dialog",
                description: "Accept or dismiss the open JavaScript dialog",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "accept": {"type": "boolean"},
                        "prompt_text": {"type": "string"},
                    },
                    "required": ["accept"],
                }),
            },
            ToolSpec {
                name: "browser_performance_metrics",
                description: "Runtime performance metrics for the attached tab",
                input_schema: json!({"type": "object", "properties": {}}),
            },
            ToolSpec {
                name: "browser_secure_fill",
                description: "Fill a field from an environment variable without echoing it",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "selector": {"type": "string"},
                        "env_var": {"type": "string"},
                    },
                    "required": ["selector", "env_var"],
                }),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knows_every_spec_name() {
        for spec in ToolDispatcher::tool_specs() {
            assert!(ToolDispatcher::knows(spec.name), "{}", spec.name);
        }
        assert!(!ToolDispatcher::knows("enable"));
        assert!(!ToolDispatcher::knows("browser_levitate"));
    }

    #[test]
    fn spec_names_are_unique() {
        let specs = ToolDispatcher::tool_specs();
        let mut names: Vec<_> = specs.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), specs.len());
    }

    #[test]
    fn reply_constructors() {
        let reply = ToolReply::json("Done.", json!({"success": true}));
        assert!(reply.text.starts_with("Done.\n"));
        assert!(!reply.is_error);

        let reply = ToolReply::assertion_failure("missing", json!({"success": false}));
        assert!(reply.is_error);

        let reply = ToolReply::text("tree", json!({})).with_image("QUJD".into(), "image/jpeg");
        assert_eq!(reply.image.unwrap().mime_type, "image/jpeg");
    }
}
