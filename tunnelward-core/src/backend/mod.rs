//! Tunnel backends
//!
//! Each backend contributes a front-end pre-flight, a worker payload and a
//! forwarding engine. The payload is the only thing that crosses the process
//! boundary; the engine never redoes pre-flight work.

pub mod cluster;
pub mod session;
pub mod ssh;

use crate::state::Lifecycle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tunnelward_common::constants::{CLUSTER_GRACE, DRAIN_TIMEOUT, SESSION_GRACE, SSH_GRACE};
use tunnelward_common::{BackendKind, Result, SshConfig, TunnelError};

pub use cluster::ClusterWorker;
pub use session::SessionWorker;

/// Everything a worker needs to run its engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    #[serde(rename = "ssh")]
    Ssh(SshConfig),
    #[serde(rename = "ssm")]
    Session(SessionWorker),
    #[serde(rename = "kubernetes")]
    Cluster(ClusterWorker),
}

impl WorkerPayload {
    pub fn kind(&self) -> BackendKind {
        match self {
            WorkerPayload::Ssh(_) => BackendKind::Ssh,
            WorkerPayload::Session(_) => BackendKind::Session,
            WorkerPayload::Cluster(_) => BackendKind::Cluster,
        }
    }

    /// How long the launcher waits before judging the worker healthy.
    pub fn grace(&self) -> Duration {
        match self.kind() {
            BackendKind::Ssh => SSH_GRACE,
            BackendKind::Session => SESSION_GRACE,
            BackendKind::Cluster => CLUSTER_GRACE,
        }
    }

    pub fn local_host(&self) -> &str {
        match self {
            WorkerPayload::Ssh(c) => &c.local_host,
            WorkerPayload::Session(_) => tunnelward_common::constants::DEFAULT_LOCAL_HOST,
            WorkerPayload::Cluster(w) => &w.config.local_host,
        }
    }

    pub fn local_port(&self) -> u16 {
        match self {
            WorkerPayload::Ssh(c) => c.local_port,
            WorkerPayload::Session(w) => w.config.local_port,
            WorkerPayload::Cluster(w) => w.config.local_port,
        }
    }

    pub fn target_port(&self) -> u16 {
        match self {
            WorkerPayload::Ssh(c) => c.target_port,
            WorkerPayload::Session(w) => w.config.target_port,
            WorkerPayload::Cluster(w) => w.config.target_port,
        }
    }

    pub fn identity(&self) -> &str {
        match self {
            WorkerPayload::Ssh(c) => &c.target_host,
            WorkerPayload::Session(w) => &w.config.instance,
            WorkerPayload::Cluster(w) => &w.config.service,
        }
    }

    pub fn ensure_port_resolved(&self) -> Result<()> {
        if self.local_port() == 0 {
            return Err(TunnelError::Config(
                "local port must be resolved before launch".into(),
            ));
        }
        Ok(())
    }
}

/// Worker-side forwarding loop for one backend.
///
/// Implementations move the lifecycle to `Running` once they accept traffic
/// and return when `shutdown` flips to `true`, after draining.
#[async_trait]
pub trait ForwardingEngine: Send {
    async fn run(self: Box<Self>, lifecycle: Lifecycle, shutdown: watch::Receiver<bool>)
        -> Result<()>;
}

pub fn engine_for(payload: WorkerPayload) -> Box<dyn ForwardingEngine> {
    match payload {
        WorkerPayload::Ssh(config) => Box::new(ssh::SshEngine::new(config)),
        WorkerPayload::Session(worker) => Box::new(session::SessionEngine::new(worker)),
        WorkerPayload::Cluster(worker) => Box::new(cluster::ClusterEngine::new(worker)),
    }
}

/// Resolves once shutdown is requested or every sender is gone.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Bind the local listener, mapping failure to an engine error.
pub(crate) async fn bind_local(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| TunnelError::Engine(format!("cannot listen on {host}:{port}: {e}")))?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Sender half used by connection tasks to report that the remote side is
/// gone for good.
pub(crate) type FatalSender = mpsc::Sender<TunnelError>;

/// Channel whose receiver, passed through [`fatal_error`], ends [`serve`].
pub(crate) fn fatal_channel() -> (FatalSender, mpsc::Receiver<TunnelError>) {
    mpsc::channel(1)
}

/// Resolves with the first reported fatal error; never resolves if none is.
pub(crate) async fn fatal_error(mut rx: mpsc::Receiver<TunnelError>) -> TunnelError {
    match rx.recv().await {
        Some(e) => e,
        None => std::future::pending().await,
    }
}

/// Accept local connections until shutdown, handing each to `handler`.
///
/// On shutdown the listener is closed first, then in-flight connections get
/// up to the drain timeout to finish before they are aborted. If `dead`
/// resolves first the engine has lost its remote side: open connections are
/// aborted and the error is returned.
pub(crate) async fn serve<F, Fut, D>(
    listener: TcpListener,
    lifecycle: &Lifecycle,
    mut shutdown: watch::Receiver<bool>,
    dead: D,
    handler: F,
) -> Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
    D: Future<Output = TunnelError>,
{
    let mut connections = JoinSet::new();
    let mut failure = None;
    tokio::pin!(dead);

    loop {
        tokio::select! {
            () = shutdown_signalled(&mut shutdown) => break,
            e = &mut dead => {
                failure = Some(e);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let fut = handler(stream, peer);
                    connections.spawn(async move {
                        if let Err(e) = fut.await {
                            warn!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    if let Some(e) = failure {
        error!("Forwarding stopped: {}", e);
        connections.abort_all();
        return Err(e);
    }

    lifecycle.begin_close();
    drain(connections, DRAIN_TIMEOUT).await;
    Ok(())
}

async fn drain(mut connections: JoinSet<()>, limit: Duration) {
    if connections.is_empty() {
        return;
    }
    info!("Draining {} connection(s)", connections.len());
    let finished = tokio::time::timeout(limit, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        warn!(
            "Aborting {} connection(s) still open after {:?}",
            connections.len(),
            limit
        );
        connections.abort_all();
    }
}
