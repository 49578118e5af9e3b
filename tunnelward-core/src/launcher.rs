//! Detached worker launcher
//!
//! Re-executes the current binary as a worker: role marker and encoded
//! payload in the environment, parent pid as the only argument, output
//! appended to a per-tunnel log file.

use crate::backend::WorkerPayload;
use crate::codec;
use crate::process::check_healthy;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use tunnelward_common::constants::{TUNNEL_CONF_ENV, TUNNEL_TYPE_ENV};
use tunnelward_common::{Result, TunnelError};

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Executable to re-invoke; the current executable when `None`
    pub program: Option<PathBuf>,
    /// Process the worker's watchdog supervises
    pub parent_pid: u32,
    /// Overrides the backend's startup grace window
    pub grace: Option<Duration>,
    /// Directory for worker log files; the system temp dir when `None`
    pub log_dir: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn new(parent_pid: u32) -> Self {
        Self {
            program: None,
            parent_pid,
            grace: None,
            log_dir: None,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// A worker that survived its startup grace window.
#[derive(Debug)]
pub struct WorkerProcess {
    pub child: Child,
    pub pid: u32,
    pub log_path: PathBuf,
    pub local_host: String,
    pub local_port: u16,
}

/// `<backend>-tunnel-<identity>-<target-port>.log`
pub fn log_file_name(payload: &WorkerPayload) -> String {
    let identity: String = payload
        .identity()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}-tunnel-{}-{}.log",
        payload.kind(),
        identity,
        payload.target_port()
    )
}

fn open_log(dir: &Path, payload: &WorkerPayload) -> Result<(File, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(payload));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

fn detach(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }
}

/// Spawn a detached worker for `payload` and wait out its grace window.
pub async fn fork(payload: &WorkerPayload, options: &LaunchOptions) -> Result<WorkerProcess> {
    payload.ensure_port_resolved()?;
    let encoded = codec::encode(payload)?;

    let log_dir = options.log_dir.clone().unwrap_or_else(std::env::temp_dir);
    let (mut log, log_path) = open_log(&log_dir, payload)?;

    let program = match &options.program {
        Some(p) => p.clone(),
        None => std::env::current_exe()?,
    };

    let mut cmd = Command::new(&program);
    cmd.arg(options.parent_pid.to_string())
        .env(TUNNEL_TYPE_ENV, payload.kind().as_str())
        .env(TUNNEL_CONF_ENV, encoded)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?));
    detach(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let reason = format!("cannot spawn {}: {e}", program.display());
            // best effort, the spawn error is what gets reported
            let _ = writeln!(log, "{reason}");
            return Err(TunnelError::TunnelStart { reason, log_path });
        }
    };
    let pid = child.id();
    info!(
        "Started {} worker {} (log: {})",
        payload.kind(),
        pid,
        log_path.display()
    );

    let grace = options.grace.unwrap_or_else(|| payload.grace());
    debug!("Waiting {:?} for worker {} to settle", grace, pid);
    tokio::time::sleep(grace).await;

    if let Some(reason) = settle_failure(&mut child, pid) {
        abandon(&mut child, pid);
        return Err(TunnelError::TunnelStart { reason, log_path });
    }

    Ok(WorkerProcess {
        child,
        pid,
        log_path,
        local_host: payload.local_host().to_string(),
        local_port: payload.local_port(),
    })
}

/// Why a worker that was given its grace window cannot be used, if it cannot.
fn settle_failure(child: &mut Child, pid: u32) -> Option<String> {
    match child.try_wait() {
        Ok(Some(status)) => Some(format!("worker {pid} exited with {status}")),
        Ok(None) => check_healthy(pid)
            .err()
            .map(|e| format!("worker {pid} is not healthy: {e}")),
        Err(e) => Some(format!("cannot query worker {pid}: {e}")),
    }
}

/// Make sure a rejected worker does not keep running untracked.
fn abandon(child: &mut Child, pid: u32) {
    if let Err(e) = child.kill() {
        debug!("Kill of rejected worker {} failed: {}", pid, e);
    }
    if let Err(e) = child.wait() {
        warn!("Cannot reap rejected worker {}: {}", pid, e);
    }
}
