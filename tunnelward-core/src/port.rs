//! Free local port allocation

use std::net::TcpListener;
use tunnelward_common::{Result, TunnelError};

/// Ask the OS for a free TCP port on `host`.
///
/// The socket is released before returning, so another process may take the
/// port in between; the forwarding engine's own bind is authoritative.
pub fn allocate_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).map_err(|e| {
        TunnelError::Config(format!("cannot allocate a local port on {host}: {e}"))
    })?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Replace a zero port with a freshly allocated one.
pub fn resolve_port(host: &str, port: u16) -> Result<u16> {
    if port == 0 {
        allocate_port(host)
    } else {
        Ok(port)
    }
}
