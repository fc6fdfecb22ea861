//! Tracing subscriber setup (§2a ambient stack).
//!
//! Installed once at startup. Writes to stderr, no ANSI, so stdout stays a
//! clean JSON-RPC stdio transport when the orchestrator is run in stdio mode.

use tracing_subscriber::EnvFilter;

pub fn init(log_level: &str, debug_logging: bool) {
    let default_directive = if debug_logging { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
