//! Tunnel lifecycle state machine shared by all backends

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};
use tunnelward_common::{Result, TunnelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Config validated, local port resolved
    Created,
    /// Backend pre-flight in progress
    Starting,
    /// Worker process is live
    Ready,
    /// Engine is listening
    Running,
    /// Shutdown requested, draining
    Closing,
    Closed,
    Error,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Error)
    }

    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::{Closed, Closing, Created, Error, Ready, Running, Starting};
        match (self, next) {
            (from, Error) => !from.is_terminal(),
            (Created, Starting)
            | (Starting, Ready)
            | (Ready, Running)
            | (Ready | Running, Closing)
            | (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Observable lifecycle of one tunnel. Clones share the same state.
#[derive(Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<TunnelState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::starting_at(TunnelState::Created)
    }

    /// Lifecycle that picks up at `state`, e.g. a worker that is already live.
    pub fn starting_at(state: TunnelState) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> TunnelState {
        *self.tx.borrow()
    }

    pub fn transition(&self, next: TunnelState) -> Result<()> {
        let mut from = next;
        let changed = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Tunnel state {} -> {}", from, next);
            Ok(())
        } else {
            Err(TunnelError::InvalidState(format!(
                "cannot move from {from} to {next}"
            )))
        }
    }

    /// Move to `Error` unless already terminal.
    pub fn fail(&self, reason: &str) {
        if self.transition(TunnelState::Error).is_ok() {
            error!("Tunnel failed: {}", reason);
        }
    }

    /// Begin shutdown if the tunnel is still up. Returns false if it was not.
    pub fn begin_close(&self) -> bool {
        self.transition(TunnelState::Closing).is_ok()
    }
}
