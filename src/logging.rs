//! Logging setup plus lightweight verbose helpers for the CLI.

use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use tracing_subscriber::EnvFilter;

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "DESK_AGENT_LOG";

/// Install the global `tracing` subscriber writing to stderr.
///
/// `DESK_AGENT_LOG` wins over the verbosity flag. Calling this twice is harmless.
pub fn init(verbose: bool) {
    set_verbose(verbose);
    let default = if verbose { "desk_agent=debug" } else { "desk_agent=info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Enable or disable verbose logging output.
pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::SeqCst);
}

/// Check whether verbose logging is enabled.
#[must_use]
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

/// Emit a verbose info message (no-op when verbosity is disabled).
pub fn info(message: impl AsRef<str>) {
    if is_verbose() {
        eprintln!("{} {}", "info".blue().bold(), message.as_ref());
    }
}

/// Emit a verbose warning message (no-op when verbosity is disabled).
pub fn warn(message: impl AsRef<str>) {
    if is_verbose() {
        eprintln!("{} {}", "warn".yellow().bold(), message.as_ref());
    }
}
