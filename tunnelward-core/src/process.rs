//! Process liveness and signalling

use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::debug;
use tunnelward_common::{Result, TunnelError};

fn snapshot(pid: u32) -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys
}

fn with_process<T>(pid: u32, f: impl FnOnce(&Process) -> Result<T>) -> Result<T> {
    let sys = snapshot(pid);
    let process = sys
        .process(Pid::from_u32(pid))
        .ok_or(TunnelError::ProcessNotFound(pid))?;
    f(process)
}

/// True if `pid` names a running process. Zombies count as dead.
pub fn is_alive(pid: u32) -> bool {
    check_healthy(pid).is_ok()
}

/// Error if `pid` is unknown or a zombie.
pub fn check_healthy(pid: u32) -> Result<()> {
    with_process(pid, |p| {
        if p.status() == ProcessStatus::Zombie {
            return Err(TunnelError::InvalidState(format!(
                "process {pid} has exited (zombie)"
            )));
        }
        Ok(())
    })
}

/// Send an interrupt to `pid`, falling back to a forced kill where the
/// platform has no interrupt signal.
pub fn interrupt(pid: u32) -> Result<()> {
    with_process(pid, |p| match p.kill_with(Signal::Interrupt) {
        Some(true) => Ok(()),
        Some(false) => Err(TunnelError::Io(std::io::Error::other(format!(
            "failed to interrupt process {pid}"
        )))),
        None => {
            debug!("interrupt unsupported on this platform, killing {}", pid);
            kill(p, pid)
        }
    })
}

/// Force-terminate `pid`.
pub fn terminate(pid: u32) -> Result<()> {
    with_process(pid, |p| kill(p, pid))
}

fn kill(p: &Process, pid: u32) -> Result<()> {
    if p.kill() {
        Ok(())
    } else {
        Err(TunnelError::Io(std::io::Error::other(format!(
            "failed to kill process {pid}"
        ))))
    }
}

/// Pid of the process that started this one.
pub fn parent_pid() -> Result<u32> {
    #[cfg(unix)]
    {
        Ok(std::os::unix::process::parent_id())
    }
    #[cfg(not(unix))]
    {
        let me = std::process::id();
        with_process(me, |p| {
            p.parent()
                .map(Pid::as_u32)
                .ok_or_else(|| TunnelError::Watchdog(format!("process {me} has no parent")))
        })
    }
}
