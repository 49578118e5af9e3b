pub mod tracing;

pub use tracing::{init_logging, LoggingConfig};

/// Minimal logging setup for the interactive front end.
/// Logs go to stderr so stdout stays free for command output.
pub fn init_minimal_logging() {
    let _ = init_logging(&LoggingConfig::front_end());
}

/// Logging for a detached worker: plain text on stderr, which the launcher
/// points at the tunnel's log file.
pub fn init_worker_logging() {
    let _ = init_logging(&LoggingConfig::worker());
}
