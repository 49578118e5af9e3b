//! SSH bastion engine
//!
//! One authenticated session to the bastion, one `direct-tcpip` channel per
//! accepted local connection.

use super::{bind_local, serve, ForwardingEngine};
use crate::state::{Lifecycle, TunnelState};
use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tunnelward_common::constants::SSH_PROBE_TIMEOUT;
use tunnelward_common::{Result, SshConfig, SshCredential, TunnelError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Accepts the bastion's host key and records its fingerprint.
struct BastionHandler {
    host: String,
}

impl client::Handler for BastionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        info!(
            "Bastion {} presented {} host key {}",
            self.host,
            server_public_key.algorithm(),
            server_public_key.fingerprint(Default::default())
        );
        Ok(true)
    }
}

pub struct SshEngine {
    config: SshConfig,
}

impl SshEngine {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<client::Handle<BastionHandler>> {
        let cfg = &self.config;
        let ssh_config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = BastionHandler {
            host: cfg.bastion_host.clone(),
        };

        info!(
            "Connecting to {}@{}:{}",
            cfg.user, cfg.bastion_host, cfg.bastion_port
        );
        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(
                Arc::new(ssh_config),
                (cfg.bastion_host.as_str(), cfg.bastion_port),
                handler,
            ),
        )
        .await
        .map_err(|_| TunnelError::Engine(format!("timed out connecting to {}", cfg.bastion_host)))?
        .map_err(|e| TunnelError::Engine(format!("cannot connect to {}: {e}", cfg.bastion_host)))?;

        let auth = match &cfg.credential {
            SshCredential::Password { password } => {
                handle.authenticate_password(&cfg.user, password).await
            }
            SshCredential::PrivateKey { material } => {
                let key = load_key(material, None)?;
                handle
                    .authenticate_publickey(&cfg.user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
                    .await
            }
            SshCredential::EncryptedPrivateKey {
                material,
                passphrase,
            } => {
                let key = load_key(material, Some(passphrase))?;
                handle
                    .authenticate_publickey(&cfg.user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
                    .await
            }
        }
        .map_err(|e| TunnelError::Engine(format!("ssh authentication error: {e}")))?;

        if !auth.success() {
            return Err(TunnelError::Engine(format!(
                "ssh authentication rejected for user {}",
                cfg.user
            )));
        }
        info!("Authenticated to {}", cfg.bastion_host);
        Ok(handle)
    }
}

/// Load a private key from a file path or from inline key text.
fn load_key(material: &str, passphrase: Option<&str>) -> Result<PrivateKey> {
    let loaded = if Path::new(material).is_file() {
        russh::keys::load_secret_key(material, passphrase)
    } else {
        russh::keys::decode_secret_key(material, passphrase)
    };
    loaded.map_err(|e| TunnelError::Config(format!("cannot load ssh private key: {e}")))
}

/// Resolves once the bastion session has closed.
async fn session_lost(handle: Arc<client::Handle<BastionHandler>>, host: String) -> TunnelError {
    let mut ticker = tokio::time::interval(SESSION_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if handle.is_closed() {
            return TunnelError::Engine(format!("ssh session to {host} was closed"));
        }
    }
}

/// Dial the freshly bound listener to prove it accepts connections.
async fn self_test(addr: SocketAddr) -> Result<()> {
    match tokio::time::timeout(SSH_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            debug!("Self-test dial to {} succeeded", addr);
            Ok(())
        }
        Ok(Err(e)) => Err(TunnelError::Engine(format!(
            "self-test dial to {addr} failed: {e}"
        ))),
        Err(_) => Err(TunnelError::Engine(format!(
            "self-test dial to {addr} timed out"
        ))),
    }
}

async fn forward(
    handle: Arc<client::Handle<BastionHandler>>,
    mut local: TcpStream,
    peer: SocketAddr,
    target_host: String,
    target_port: u16,
) -> Result<()> {
    let channel = handle
        .channel_open_direct_tcpip(
            target_host.as_str(),
            u32::from(target_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
        .map_err(|e| {
            TunnelError::Engine(format!(
                "cannot open channel to {target_host}:{target_port}: {e}"
            ))
        })?;
    let mut remote = channel.into_stream();
    let (up, down) = tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    debug!("Connection from {} closed ({} up, {} down)", peer, up, down);
    Ok(())
}

#[async_trait]
impl ForwardingEngine for SshEngine {
    async fn run(
        self: Box<Self>,
        lifecycle: Lifecycle,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let handle = Arc::new(self.connect().await?);
        let listener = bind_local(&self.config.local_host, self.config.local_port).await?;
        self_test(listener.local_addr()?).await?;
        lifecycle.transition(TunnelState::Running)?;
        info!(
            "Forwarding {}:{} -> {}:{} via {}",
            self.config.local_host,
            self.config.local_port,
            self.config.target_host,
            self.config.target_port,
            self.config.bastion_host
        );

        let target_host = self.config.target_host.clone();
        let target_port = self.config.target_port;
        let forwarding = handle.clone();
        let dead = session_lost(handle.clone(), self.config.bastion_host.clone());
        serve(listener, &lifecycle, shutdown, dead, move |stream, peer| {
            forward(
                forwarding.clone(),
                stream,
                peer,
                target_host.clone(),
                target_port,
            )
        })
        .await?;

        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("Error disconnecting from bastion: {}", e);
        }
        Ok(())
    }
}
