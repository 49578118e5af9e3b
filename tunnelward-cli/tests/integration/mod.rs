#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for `tunnelward`
//!
//! These tests drive the real binary as a detached worker and as a front end.

#[cfg(unix)]
mod cli_test;
#[cfg(unix)]
mod launcher_test;
#[cfg(unix)]
mod watchdog_test;

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;

static NEXT_PORT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(31000);

pub fn get_free_port() -> u16 {
    use std::sync::atomic::Ordering;
    loop {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

/// Path of the binary under test
pub fn tunnelward_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tunnelward"))
}

/// Write an executable shell script into `dir`
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Wait for a child to exit, polling `try_wait`
pub async fn wait_for_exit(
    child: &mut std::process::Child,
    timeout: Duration,
) -> Option<std::process::ExitStatus> {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        sleep(Duration::from_millis(50)).await;
    }
    None
}
