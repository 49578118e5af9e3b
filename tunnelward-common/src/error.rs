//! Error types for `tunnelward`

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or contradictory configuration, detected before any spawn
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend pre-flight call failed before any worker existed
    #[error("Pre-flight failed: {0}")]
    Preflight(String),

    /// The service selector matched no pods
    #[error("no pods found for service {namespace}/{service}")]
    NoPodsFound { namespace: String, service: String },

    /// Worker failed to spawn or exited inside the grace window
    #[error("tunnel process failed to start ({reason}). check {} for more information", log_path.display())]
    TunnelStart { reason: String, log_path: PathBuf },

    /// The watchdog could not resolve the process it must supervise
    #[error("Watchdog failure: {0}")]
    Watchdog(String),

    /// Encoded configuration could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Forwarding engine failed at runtime
    #[error("Forwarding engine error: {0}")]
    Engine(String),

    /// Invalid lifecycle transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No process with this id
    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    /// One or more independent teardown steps failed
    #[error("Teardown incomplete: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;
