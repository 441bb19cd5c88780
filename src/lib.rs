// Library target exists to expose internal modules for integration tests.
// The binary entry point is in main.rs.

mod cli;

pub mod config;
pub mod error;
pub mod experiments;
pub mod extension;
pub mod frontend;
pub mod humanize;
pub mod manager;
pub mod secure_eval;
pub mod tools;
pub mod transport;

/// Crate version reported in the status header and the MCP `initialize`
/// response.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the clap `Command` definition.
///
/// Exposed for CLI self-tests.
#[must_use]
pub fn command() -> clap::Command {
    <cli::Cli as clap::CommandFactory>::command()
}
