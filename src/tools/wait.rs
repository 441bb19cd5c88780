//! Post-navigation settling: a fixed delay by default, or the
//! extension's readiness probe when the `smart_waiting` experiment is
//! on.

use serde_json::json;
use tokio::time::Duration;
use tracing::debug;

use crate::experiments;

use super::ToolDispatcher;

/// Fixed settle delay after history navigation and in-page loads.
pub const FALLBACK_DELAY_MS: u64 = 1500;

/// How long the extension's `waitForReady` probe may take.
const READY_TIMEOUT_MS: u64 = 5000;

/// Wait for the page to settle after a navigation.
///
/// With `smart_waiting` enabled, asks the extension to combine
/// DOM-stability and network-idle detection; any failure (including an
/// older extension without the command) falls back to the fixed delay.
pub async fn settle_after_navigation(d: &ToolDispatcher) {
    if experiments::registry().is_enabled("smart_waiting") {
        let result = d
            .transport()
            .send_cmd(
                "waitForReady",
                Some(json!({"timeoutMs": READY_TIMEOUT_MS})),
                Some(Duration::from_millis(READY_TIMEOUT_MS + 2000)),
            )
            .await;
        match result {
            Ok(_) => return,
            Err(e) => debug!(error = %e, "waitForReady unavailable, using fixed delay"),
        }
    }
    d.sleep(FALLBACK_DELAY_MS).await;
}
