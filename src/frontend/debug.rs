//! Hot-reload wrapper: forks the server as a child with inherited
//! stdio and respawns it whenever it exits with the reload sentinel.
//! The agent's stdio pipes survive the respawn because the child
//! inherits the wrapper's descriptors.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use super::HOT_RELOAD_EXIT_CODE;

/// Run the wrapper loop. Returns the final exit code to propagate.
pub async fn run_wrapper(program: &std::path::Path, args: &[String]) -> i32 {
    loop {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "failed to spawn server child");
                return 1;
            }
        };

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "failed to wait for server child");
                return 1;
            }
        };

        match status.code() {
            Some(HOT_RELOAD_EXIT_CODE) => {
                debug!("hot reload requested, respawning server");
            }
            Some(code) => return code,
            // Killed by signal; report a generic failure.
            None => return 1,
        }
    }
}

/// Strip the wrapper flag so the child runs the real server.
#[must_use]
pub fn child_args(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|arg| arg.as_str() != "--debug-wrapper")
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_args_strip_wrapper_flag() {
        let args = vec![
            "--debug-wrapper".to_owned(),
            "--port".to_owned(),
            "5555".to_owned(),
        ];
        assert_eq!(child_args(&args), vec!["--port", "5555"]);
    }

    #[tokio::test]
    async fn wrapper_respawns_on_42_and_propagates_exit() {
        // A shell stand-in for the server: exit 42 once (first run,
        // flagged by the marker file's absence), then exit 7.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let script = format!(
            "if [ -e {marker} ]; then exit 7; else touch {marker}; exit 42; fi",
            marker = marker.display(),
        );
        let code = run_wrapper(
            std::path::Path::new("/bin/sh"),
            &["-c".to_owned(), script],
        )
        .await;
        assert_eq!(code, 7);
        assert!(marker.exists(), "child should have respawned once");
    }
}
