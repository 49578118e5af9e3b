//! Tunnel lifecycle and supervision for `tunnelward`
//!
//! The front end validates a [`TunnelConfig`](tunnelward_common::TunnelConfig),
//! runs backend pre-flight and forks a detached worker; the worker watches its
//! parent and drives one forwarding engine.

pub mod backend;
pub mod codec;
pub mod launcher;
pub mod port;
pub mod process;
pub mod registry;
pub mod state;
pub mod tunnel;
pub mod watchdog;
pub mod worker;

pub use backend::{engine_for, ForwardingEngine, WorkerPayload};
pub use launcher::{fork, LaunchOptions, WorkerProcess};
pub use port::allocate_port;
pub use registry::{close_tunnel, SessionRecord, SessionRegistry};
pub use state::{Lifecycle, TunnelState};
pub use tunnel::{close, open, TunnelHandle};
pub use watchdog::{Watchdog, WatchdogBinding};
pub use worker::WorkerLaunch;
