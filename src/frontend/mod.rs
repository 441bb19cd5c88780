//! Stdio frontends: MCP framing (default) and plain JSON-RPC script
//! mode, plus the hot-reload debug wrapper. Exactly one frontend runs
//! per process; stdout belongs to it, so logs go to stderr.

pub mod debug;
pub mod mcp;
pub mod script;

/// Exit code a child uses to request a hot reload from the wrapper.
pub const HOT_RELOAD_EXIT_CODE: i32 = 42;
