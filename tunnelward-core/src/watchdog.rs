//! Parent-liveness watchdog
//!
//! A worker must not outlive the process that launched it. The watchdog polls
//! the parent and, once it is gone, interrupts the target (this process by
//! default). If the target survives the interrupt for a few polls it is
//! force-terminated.

use crate::process::{check_healthy, interrupt, is_alive, terminate};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnelward_common::constants::{WATCHDOG_ESCALATE_AFTER, WATCHDOG_POLL_INTERVAL};
use tunnelward_common::{Result, TunnelError};

pub struct Watchdog {
    parent: u32,
    target: u32,
    interval: Duration,
    escalate_after: u32,
}

impl Watchdog {
    pub fn new(parent: u32) -> Self {
        Self {
            parent,
            target: std::process::id(),
            interval: WATCHDOG_POLL_INTERVAL,
            escalate_after: WATCHDOG_ESCALATE_AFTER,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Supervise another process instead of this one.
    #[must_use]
    pub fn with_target(mut self, target: u32) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_escalation(mut self, polls: u32) -> Self {
        self.escalate_after = polls;
        self
    }

    /// Validate the parent and start polling it in the background.
    pub fn spawn(self) -> Result<WatchdogBinding> {
        check_healthy(self.parent).map_err(|e| {
            TunnelError::Watchdog(format!("cannot watch process {}: {e}", self.parent))
        })?;

        let (parent, target) = (self.parent, self.target);
        info!(
            "Watching process {} every {:?} on behalf of {}",
            parent, self.interval, target
        );
        let handle = tokio::spawn(self.run());
        Ok(WatchdogBinding {
            parent,
            target,
            handle,
        })
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        let mut misses: u32 = 0;
        loop {
            ticker.tick().await;
            if is_alive(self.parent) {
                continue;
            }

            misses = misses.saturating_add(1);
            let result = if misses > self.escalate_after {
                warn!(
                    "Process {} still alive after {} interrupts, terminating",
                    self.target, self.escalate_after
                );
                terminate(self.target)
            } else {
                info!(
                    "Parent process {} is gone, interrupting {}",
                    self.parent, self.target
                );
                interrupt(self.target)
            };
            if let Err(e) = result {
                debug!("Watchdog signal to {} failed: {}", self.target, e);
            }
        }
    }
}

/// Live (target -> parent) supervision relation.
pub struct WatchdogBinding {
    pub parent: u32,
    pub target: u32,
    handle: JoinHandle<()>,
}

impl WatchdogBinding {
    pub fn stop(self) {
        self.handle.abort();
    }
}
