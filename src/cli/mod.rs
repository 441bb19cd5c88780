use std::path::PathBuf;

use clap::Parser;

/// Browser-automation broker: MCP on stdio, browser extension over a
/// localhost WebSocket.
#[derive(Debug, Parser)]
#[command(name = "supersurf", version, about)]
pub struct Cli {
    /// Port the extension WebSocket listener binds on `enable`.
    #[arg(long, env = "SUPERSURF_PORT")]
    pub port: Option<u16>,

    /// Wire-frame logging: `false`, `truncate`, or `no_truncate`.
    #[arg(long)]
    pub debug: Option<String>,

    /// Speak plain newline-delimited JSON-RPC instead of MCP framing.
    #[arg(long)]
    pub script: bool,

    /// Run as the hot-reload wrapper: respawn the server when it exits
    /// with code 42.
    #[arg(long)]
    pub debug_wrapper: bool,

    /// Path to a TOML config file (default: the user config dir).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_script_mode() {
        let cli = Cli::parse_from(["supersurf", "--script", "--port", "6001"]);
        assert!(cli.script);
        assert_eq!(cli.port, Some(6001));
        assert!(!cli.debug_wrapper);
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["supersurf"]);
        assert!(!cli.script);
        assert!(cli.port.is_none());
        assert!(cli.debug.is_none());
    }
}
