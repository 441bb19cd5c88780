mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use supersurf::config::{self, DebugMode, EXPERIMENTS_ENV};
use supersurf::frontend;
use supersurf::manager::ConnectionManager;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The wrapper respawns the real server on the hot-reload sentinel.
    if cli.debug_wrapper {
        init_tracing(DebugMode::Off);
        let args: Vec<String> = std::env::args().skip(1).collect();
        let child_args = frontend::debug::child_args(&args);
        let program = match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("cannot locate own executable: {e}");
                std::process::exit(1);
            }
        };
        let code = frontend::debug::run_wrapper(&program, &child_args).await;
        std::process::exit(code);
    }

    let cli_debug = match cli.debug.as_deref() {
        Some(value) => match DebugMode::parse(value) {
            Some(mode) => Some(mode),
            None => {
                eprintln!("invalid --debug value: {value} (expected false, truncate, no_truncate)");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let file = match config::load_config_file(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let env_experiments = std::env::var(EXPERIMENTS_ENV).ok();
    let config = config::resolve_config(&file, env_experiments.as_deref(), cli.port, cli_debug);

    init_tracing(config.debug);
    debug!(port = config.port, script = cli.script, "starting supersurf");

    let manager = ConnectionManager::new(config);
    let serve = run_frontend(Arc::clone(&manager), cli.script);
    tokio::select! {
        () = serve => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "signal listener failed");
            }
            debug!("interrupted, shutting down");
        }
    }

    // Best-effort teardown so the extension sees a clean close.
    let _ = manager.disable().await;
}

async fn run_frontend(manager: Arc<ConnectionManager>, script: bool) {
    if script {
        frontend::script::run(manager).await;
    } else {
        frontend::mcp::run(manager).await;
    }
}

/// Logs go to stderr; stdout carries the protocol. `RUST_LOG`
/// overrides; debug mode raises the default level.
fn init_tracing(debug: DebugMode) {
    let default_level = if debug.is_enabled() {
        "supersurf=debug"
    } else {
        "supersurf=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
