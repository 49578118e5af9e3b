//! Environment names, timings and defaults shared by the front end and the worker.
//!
//! Use these constants instead of magic values so the two sides of the
//! process handoff always agree.

use std::time::Duration;

/// Environment variable carrying the role marker (`ssh`, `ssm`, `kubernetes`).
/// Absent means the process is a front end.
pub const TUNNEL_TYPE_ENV: &str = "TUNNELWARD_TUNNEL_TYPE";

/// Environment variable carrying the encoded worker payload.
pub const TUNNEL_CONF_ENV: &str = "TUNNELWARD_TUNNEL_CONF";

/// How often the watchdog checks the supervised parent.
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Number of consecutive failed polls after an interrupt before the target is force-killed.
pub const WATCHDOG_ESCALATE_AFTER: u32 = 3;

/// Startup grace window for SSH workers.
pub const SSH_GRACE: Duration = Duration::from_secs(5);

/// Startup grace window for AWS SSM session workers.
pub const SESSION_GRACE: Duration = Duration::from_secs(5);

/// Startup grace window for Kubernetes port-forward workers.
pub const CLUSTER_GRACE: Duration = Duration::from_secs(2);

/// Timeout of the local self-test dial the SSH worker performs once listening.
pub const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on draining in-flight connections during shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default local bind host.
pub const DEFAULT_LOCAL_HOST: &str = "localhost";

/// SSM document used for remote-host port forwarding.
pub const SSM_PORT_FORWARD_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// Name of the environment variable the session plugin reads the session response from.
pub const SSM_RESPONSE_ENV: &str = "AWS_SSM_START_SESSION_RESPONSE";

/// Default session plugin executable, resolved through `PATH`.
pub const DEFAULT_SSM_PLUGIN: &str = "session-manager-plugin";
