//! Worker process entry
//!
//! A worker is this same executable started by the launcher with a role
//! marker and an encoded payload in its environment. It supervises its parent
//! and runs one forwarding engine until interrupted.

use crate::backend::{engine_for, WorkerPayload};
use crate::codec;
use crate::state::{Lifecycle, TunnelState};
use crate::watchdog::Watchdog;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};
use tunnelward_common::constants::{TUNNEL_CONF_ENV, TUNNEL_TYPE_ENV};
use tunnelward_common::{BackendKind, Result, TunnelError};

/// Descriptor of a worker launch, read once from the process environment.
#[derive(Debug)]
pub struct WorkerLaunch {
    pub kind: BackendKind,
    pub payload: WorkerPayload,
    pub parent_pid: u32,
}

impl WorkerLaunch {
    /// `Ok(None)` when this process is not a worker.
    ///
    /// Both handoff variables are removed from the environment before
    /// returning, so call this before any thread (including the async
    /// runtime) is started.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(role) = std::env::var_os(TUNNEL_TYPE_ENV) else {
            return Ok(None);
        };
        let conf = std::env::var(TUNNEL_CONF_ENV).ok();
        std::env::remove_var(TUNNEL_TYPE_ENV);
        std::env::remove_var(TUNNEL_CONF_ENV);

        let parent = std::env::args().nth(1);
        Self::parse(&role.to_string_lossy(), conf.as_deref(), parent.as_deref()).map(Some)
    }

    pub fn parse(role: &str, conf: Option<&str>, parent: Option<&str>) -> Result<Self> {
        let kind: BackendKind = role.parse()?;
        let conf = conf.ok_or_else(|| TunnelError::Decode(format!("{TUNNEL_CONF_ENV} is not set")))?;
        let payload: WorkerPayload = codec::decode(conf)?;
        if payload.kind() != kind {
            return Err(TunnelError::Decode(format!(
                "payload is for {} but role is {kind}",
                payload.kind()
            )));
        }
        let parent_pid = parent
            .ok_or_else(|| TunnelError::Config("missing parent pid argument".into()))?
            .parse::<u32>()
            .map_err(|e| TunnelError::Config(format!("invalid parent pid: {e}")))?;

        Ok(Self {
            kind,
            payload,
            parent_pid,
        })
    }

    /// Supervise the parent and run the engine until shutdown.
    pub async fn run(self) -> Result<()> {
        let span = info_span!("worker", role = %self.kind, pid = std::process::id());
        async move {
            info!(
                "Worker started for {}:{}, parent {}",
                self.payload.local_host(),
                self.payload.local_port(),
                self.parent_pid
            );
            let signals = ShutdownSignals::install()?;
            let watchdog = Watchdog::new(self.parent_pid).spawn()?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(forward_signals(signals, shutdown_tx));

            let lifecycle = Lifecycle::starting_at(TunnelState::Ready);
            let result = engine_for(self.payload)
                .run(lifecycle.clone(), shutdown_rx)
                .await;
            watchdog.stop();

            match result {
                Ok(()) => {
                    lifecycle.begin_close();
                    lifecycle.transition(TunnelState::Closed)?;
                    info!("Worker stopped");
                    Ok(())
                }
                Err(e) => {
                    lifecycle.fail(&e.to_string());
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Signal streams registered up front, so a signal that arrives while the
/// engine is starting is still turned into a graceful shutdown.
#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("Received SIGINT, shutting down"),
            _ = self.terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    async fn recv(mut self) {
        self.ctrl_c.recv().await;
        info!("Received interrupt, shutting down");
    }
}

/// Turn the first interrupt or terminate signal into a shutdown request.
async fn forward_signals(signals: ShutdownSignals, shutdown_tx: watch::Sender<bool>) {
    signals.recv().await;
    let _ = shutdown_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelward_common::{SshConfig, SshCredential};

    fn encoded() -> String {
        codec::encode(&WorkerPayload::Ssh(SshConfig {
            local_host: "localhost".into(),
            local_port: 15432,
            bastion_host: "bastion".into(),
            bastion_port: 22,
            user: "ops".into(),
            credential: SshCredential::Password {
                password: "pw".into(),
            },
            target_host: "db".into(),
            target_port: 5432,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_valid_launch() {
        let launch = WorkerLaunch::parse("ssh", Some(&encoded()), Some("4242")).unwrap();
        assert_eq!(launch.kind, BackendKind::Ssh);
        assert_eq!(launch.parent_pid, 4242);
        assert_eq!(launch.payload.local_port(), 15432);
    }

    #[test]
    fn test_parse_rejects_role_mismatch() {
        let err = WorkerLaunch::parse("kubernetes", Some(&encoded()), Some("1")).unwrap_err();
        assert!(matches!(err, TunnelError::Decode(_)));
    }

    #[test]
    fn test_parse_rejects_missing_pieces() {
        assert!(matches!(
            WorkerLaunch::parse("ssh", None, Some("1")),
            Err(TunnelError::Decode(_))
        ));
        assert!(matches!(
            WorkerLaunch::parse("ssh", Some(&encoded()), None),
            Err(TunnelError::Config(_))
        ));
        assert!(matches!(
            WorkerLaunch::parse("ssh", Some(&encoded()), Some("parent")),
            Err(TunnelError::Config(_))
        ));
        assert!(matches!(
            WorkerLaunch::parse("ssh", Some("%%%"), Some("1")),
            Err(TunnelError::Decode(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_requests_shutdown() {
        let signals = ShutdownSignals::install().unwrap();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_signals(signals, shutdown_tx));

        crate::process::interrupt(std::process::id()).unwrap();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            shutdown_rx.wait_for(|stop| *stop),
        )
        .await
        .unwrap()
        .unwrap();
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_fails_when_parent_is_gone() {
        let mut launch = WorkerLaunch::parse("ssh", Some(&encoded()), Some("1")).unwrap();
        launch.parent_pid = u32::MAX - 7;
        let err = launch.run().await.unwrap_err();
        assert!(matches!(err, TunnelError::Watchdog(_)));
    }
}
