//! Subcommand implementations

pub mod close;
pub mod kubernetes;
pub mod ssh;
pub mod ssm;
pub mod version;

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tunnelward_core::{process, LaunchOptions, TunnelHandle};

/// Options shared by every subcommand that opens a tunnel
#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Directory for tunnel log files (defaults to the system temp dir)
    #[arg(long, env = "TUNNELWARD_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Process whose exit closes the tunnel (defaults to the caller of tunnelward)
    #[arg(long, env = "TUNNELWARD_WATCH_PID")]
    pub watch_pid: Option<u32>,
}

impl LaunchArgs {
    pub fn options(&self) -> Result<LaunchOptions> {
        let parent = match self.watch_pid {
            Some(pid) => pid,
            None => process::parent_pid().context("cannot determine the process to watch")?,
        };
        let mut options = LaunchOptions::new(parent);
        if let Some(dir) = &self.log_dir {
            options = options.with_log_dir(dir);
        }
        Ok(options)
    }
}

/// Print the handle as JSON on stdout for scripts to pick up.
pub fn print_handle(handle: &TunnelHandle) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(handle)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_watch_pid_is_used() {
        let args = LaunchArgs {
            log_dir: Some(PathBuf::from("/var/log/tunnels")),
            watch_pid: Some(4242),
        };
        let options = args.options().unwrap();
        assert_eq!(options.parent_pid, 4242);
        assert_eq!(options.log_dir, Some(PathBuf::from("/var/log/tunnels")));
    }

    #[test]
    fn test_watch_pid_defaults_to_parent() {
        let args = LaunchArgs {
            log_dir: None,
            watch_pid: None,
        };
        let options = args.options().unwrap();
        assert_eq!(options.parent_pid, process::parent_pid().unwrap());
        assert!(options.log_dir.is_none());
    }
}
