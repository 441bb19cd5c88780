//! Page-state diffing (the `page_diffing` experiment): snapshot the
//! page before and after an interaction sequence and report what
//! changed, with a confidence score discounting dynamic-page noise.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::BrokerError;
use crate::transport::TransportHandle;

/// Diff sections below this confidence are not rendered.
pub const CONFIDENCE_RENDER_FLOOR: f64 = 0.7;

/// Flat penalty applied per confidence trigger.
const CONFIDENCE_PENALTY: f64 = 0.05;

/// Pages with more elements than this are considered too large for a
/// trustworthy text diff.
const LARGE_PAGE_THRESHOLD: i64 = 5000;

/// Entries longer than this are middle-ellipsized in the rendering.
const ENTRY_DISPLAY_CHARS: usize = 60;

/// Coarse page state captured by the extension's `capturePageState`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PageStateSnapshot {
    pub element_count: i64,
    pub text_content: Vec<String>,
    pub shadow_root_count: i64,
    pub iframe_count: i64,
    pub hidden_element_count: i64,
    pub page_element_count: i64,
}

/// What changed between two snapshots.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub count_delta: i64,
}

impl SnapshotDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.count_delta == 0
    }
}

/// Capture the current page state through the extension.
///
/// # Errors
///
/// Transport/peer errors from `capturePageState`.
pub async fn capture_page_state(
    transport: &TransportHandle,
) -> Result<PageStateSnapshot, BrokerError> {
    let value = transport
        .send_cmd("capturePageState", Some(json!({})), None)
        .await
        .map_err(BrokerError::from)?;
    serde_json::from_value(value)
        .map_err(|e| BrokerError::InvalidParams(format!("malformed page state: {e}")))
}

/// Text entries unique to either side, plus the element-count delta.
#[must_use]
pub fn diff_snapshots(before: &PageStateSnapshot, after: &PageStateSnapshot) -> SnapshotDiff {
    let added = after
        .text_content
        .iter()
        .filter(|entry| !before.text_content.contains(entry))
        .cloned()
        .collect();
    let removed = before
        .text_content
        .iter()
        .filter(|entry| !after.text_content.contains(entry))
        .cloned()
        .collect();
    SnapshotDiff {
        added,
        removed,
        count_delta: after.element_count - before.element_count,
    }
}

/// Confidence in the diff, in `[0, 1]`.
///
/// Starts at 1.0 and loses a flat 0.05 for each of: shadow roots
/// present, iframes present, page larger than 5000 elements. Hidden
/// elements do not affect confidence.
#[must_use]
pub fn calculate_confidence(snapshot: &PageStateSnapshot) -> f64 {
    let mut confidence = 1.0;
    if snapshot.shadow_root_count > 0 {
        confidence -= CONFIDENCE_PENALTY;
    }
    if snapshot.iframe_count > 0 {
        confidence -= CONFIDENCE_PENALTY;
    }
    if snapshot.page_element_count > LARGE_PAGE_THRESHOLD {
        confidence -= CONFIDENCE_PENALTY;
    }
    confidence.clamp(0.0, 1.0)
}

/// Render the diff section appended to interaction results, or `None`
/// when confidence falls below the rendering floor.
#[must_use]
pub fn render_diff(diff: &SnapshotDiff, confidence: f64) -> Option<String> {
    if confidence < CONFIDENCE_RENDER_FLOOR {
        return None;
    }

    let mut out = String::from("\n## Page changes\n");
    if diff.is_empty() {
        out.push_str("No visible changes\n");
    } else {
        if diff.count_delta != 0 {
            out.push_str(&format!("Elements: {:+}\n", diff.count_delta));
        }
        render_entries(&mut out, "Added", &diff.added);
        render_entries(&mut out, "Removed", &diff.removed);
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let percent = (confidence * 100.0).round() as u32;
    out.push_str(&format!("Confidence: {percent}%\n"));
    Some(out)
}

fn render_entries(out: &mut String, label: &str, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    for entry in entries.iter().take(5) {
        out.push_str(&format!("{label}: {}\n", middle_ellipsis(entry)));
    }
    if entries.len() > 5 {
        out.push_str(&format!("  +{} more\n", entries.len() - 5));
    }
}

/// Keep the head and tail of long entries, eliding the middle.
fn middle_ellipsis(entry: &str) -> String {
    let chars: Vec<char> = entry.chars().collect();
    if chars.len() <= ENTRY_DISPLAY_CHARS {
        return entry.to_owned();
    }
    let head: String = chars[..30].iter().collect();
    let tail: String = chars[chars.len() - 29..].iter().collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(elements: i64, text: &[&str]) -> PageStateSnapshot {
        PageStateSnapshot {
            element_count: elements,
            text_content: text.iter().map(|s| (*s).to_owned()).collect(),
            ..PageStateSnapshot::default()
        }
    }

    #[test]
    fn diff_reports_added_removed_and_delta() {
        let before = snapshot(100, &["Hello"]);
        let after = snapshot(115, &["Hello", "Submitted"]);
        let diff = diff_snapshots(&before, &after);
        assert_eq!(diff.added, vec!["Submitted"]);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.count_delta, 15);
    }

    #[test]
    fn empty_diff() {
        let state = snapshot(10, &["same"]);
        let diff = diff_snapshots(&state, &state.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn confidence_in_bounds_and_flat_penalties() {
        let clean = PageStateSnapshot {
            page_element_count: 1000,
            ..PageStateSnapshot::default()
        };
        assert!((calculate_confidence(&clean) - 1.0).abs() < f64::EPSILON);

        let noisy = PageStateSnapshot {
            shadow_root_count: 4,
            iframe_count: 2,
            page_element_count: 9000,
            ..PageStateSnapshot::default()
        };
        // Each trigger costs a flat 0.05 regardless of magnitude.
        assert!((calculate_confidence(&noisy) - 0.85).abs() < 1e-9);
    }

    #[test]
    fn hidden_elements_do_not_affect_confidence() {
        let state = PageStateSnapshot {
            hidden_element_count: 500,
            ..PageStateSnapshot::default()
        };
        assert!((calculate_confidence(&state) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn render_full_confidence_scenario() {
        let before = snapshot(100, &["Hello"]);
        let after = snapshot(115, &["Hello", "Submitted"]);
        let diff = diff_snapshots(&before, &after);
        let text = render_diff(&diff, calculate_confidence(&after)).unwrap();
        assert!(text.contains("+15"));
        assert!(text.contains("Added: Submitted"));
        assert!(text.contains("Confidence: 100%"));
    }

    #[test]
    fn render_hides_low_confidence() {
        let diff = SnapshotDiff {
            added: vec!["x".into()],
            removed: vec![],
            count_delta: 1,
        };
        assert!(render_diff(&diff, 0.69).is_none());
        assert!(render_diff(&diff, 0.7).is_some());
    }

    #[test]
    fn render_empty_diff_says_so() {
        let diff = SnapshotDiff {
            added: vec![],
            removed: vec![],
            count_delta: 0,
        };
        let text = render_diff(&diff, 1.0).unwrap();
        assert!(text.contains("No visible changes"));
    }

    #[test]
    fn render_caps_at_five_entries() {
        let diff = SnapshotDiff {
            added: (0..8).map(|i| format!("entry {i}")).collect(),
            removed: vec![],
            count_delta: 8,
        };
        let text = render_diff(&diff, 1.0).unwrap();
        assert_eq!(text.matches("Added:").count(), 5);
        assert!(text.contains("+3 more"));
    }

    #[test]
    fn middle_ellipsis_truncates_long_entries() {
        let long = "a".repeat(100);
        let out = middle_ellipsis(&long);
        assert_eq!(out.chars().count(), 60);
        assert!(out.contains('…'));
        assert_eq!(middle_ellipsis("short"), "short");
    }

    #[test]
    fn snapshot_deserializes_camel_case() {
        let state: PageStateSnapshot = serde_json::from_value(serde_json::json!({
            "elementCount": 12,
            "textContent": ["a"],
            "shadowRootCount": 1,
            "iframeCount": 0,
            "hiddenElementCount": 3,
            "pageElementCount": 200,
        }))
        .unwrap();
        assert_eq!(state.element_count, 12);
        assert_eq!(state.shadow_root_count, 1);
    }

    #[test]
    fn snapshot_tolerates_missing_fields() {
        let state: PageStateSnapshot =
            serde_json::from_value(serde_json::json!({"elementCount": 5})).unwrap();
        assert_eq!(state.element_count, 5);
        assert!(state.text_content.is_empty());
    }
}
