//! Common utilities and types for `tunnelward`

pub mod config;
pub mod constants;
pub mod error;

pub use config::{
    default_user, BackendKind, ClusterAccess, ClusterConfig, ExecCredential, SessionConfig,
    SshConfig, SshCredential, TunnelConfig,
};
pub use error::{Result, TunnelError};
