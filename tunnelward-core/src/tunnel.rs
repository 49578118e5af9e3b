//! Front-end tunnel operations: open and close

use crate::backend::cluster::{self, ClusterApi, KubeCluster};
use crate::backend::session::{self, SessionBroker, SsmBroker};
use crate::backend::WorkerPayload;
use crate::launcher::{self, LaunchOptions};
use crate::port::resolve_port;
use crate::registry::{close_tunnel, SessionRecord, SessionRegistry};
use crate::state::{Lifecycle, TunnelState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};
use tunnelward_common::{ClusterConfig, Result, SessionConfig, TunnelConfig};

/// What the caller gets back from a successful open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHandle {
    pub local_host: String,
    pub local_port: u16,
    pub pid: u32,
    pub log_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRecord>,
}

/// Validate `config` and resolve a zero local port.
pub fn prepare(mut config: TunnelConfig) -> Result<TunnelConfig> {
    config.validate()?;
    let port = resolve_port(config.local_host(), config.local_port())?;
    config.set_local_port(port);
    Ok(config)
}

/// Open a tunnel: pre-flight in this process, then fork a detached worker.
pub async fn open(config: TunnelConfig, options: &LaunchOptions) -> Result<TunnelHandle> {
    let lifecycle = Lifecycle::new();
    let config = prepare(config)?;
    lifecycle.transition(TunnelState::Starting)?;

    let result = match config {
        TunnelConfig::Ssh(c) => launch(&lifecycle, WorkerPayload::Ssh(c), options).await,
        TunnelConfig::Session(c) => {
            let broker =
                SsmBroker::connect(&c.region, c.profile.as_deref(), c.role_arn.as_deref()).await;
            open_session(&lifecycle, &broker, c, options).await
        }
        TunnelConfig::Cluster(c) => match KubeCluster::connect(&c.access).await {
            Ok(api) => open_cluster(&lifecycle, &api, c, options).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = &result {
        lifecycle.fail(&e.to_string());
    }
    result
}

/// Start a remote session, then fork its worker. The session is terminated
/// again if the worker does not come up.
pub async fn open_session(
    lifecycle: &Lifecycle,
    broker: &dyn SessionBroker,
    config: SessionConfig,
    options: &LaunchOptions,
) -> Result<TunnelHandle> {
    let worker = session::preflight(broker, &config).await?;
    let record = SessionRecord {
        session_id: worker.session.session_id.clone(),
        region: config.region.clone(),
        profile: config.profile.clone(),
        role_arn: config.role_arn.clone(),
    };

    match launch(lifecycle, WorkerPayload::Session(worker), options).await {
        Ok(mut handle) => {
            handle.session = Some(record);
            Ok(handle)
        }
        Err(e) => {
            warn!(
                "Worker failed to start, terminating session {}",
                record.session_id
            );
            if let Err(rollback) = broker.terminate_session(&record.session_id).await {
                warn!("Rollback of session {} failed: {}", record.session_id, rollback);
            }
            Err(e)
        }
    }
}

/// Resolve the service to a pod, then fork the worker.
pub async fn open_cluster(
    lifecycle: &Lifecycle,
    api: &dyn ClusterApi,
    config: ClusterConfig,
    options: &LaunchOptions,
) -> Result<TunnelHandle> {
    let worker = cluster::preflight(api, &config).await?;
    launch(lifecycle, WorkerPayload::Cluster(worker), options).await
}

async fn launch(
    lifecycle: &Lifecycle,
    payload: WorkerPayload,
    options: &LaunchOptions,
) -> Result<TunnelHandle> {
    let worker = launcher::fork(&payload, options).await?;
    lifecycle.transition(TunnelState::Ready)?;
    info!(
        "Tunnel {}:{} up (pid {})",
        worker.local_host, worker.local_port, worker.pid
    );
    Ok(TunnelHandle {
        local_host: worker.local_host,
        local_port: worker.local_port,
        pid: worker.pid,
        log_path: worker.log_path,
        session: None,
    })
}

/// Close a tunnel previously returned by [`open`].
pub async fn close(handle: &TunnelHandle) -> Result<()> {
    let registry = match &handle.session {
        Some(record) => SessionRegistry::for_record(record),
        None => SessionRegistry::aws(None, None),
    };
    close_tunnel(handle.pid, handle.session.as_ref(), &registry).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::session::{RemoteSession, SessionInput};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tunnelward_common::{ClusterAccess, SshConfig, SshCredential, TunnelError};

    #[derive(Default)]
    struct FakeBroker {
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionBroker for FakeBroker {
        async fn start_session(&self, _input: &SessionInput) -> Result<RemoteSession> {
            Ok(RemoteSession {
                session_id: "sess-1".into(),
                token_value: "t".into(),
                stream_url: "wss://example".into(),
            })
        }

        async fn terminate_session(&self, session_id: &str) -> Result<()> {
            self.terminated.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    struct EmptyCluster;

    #[async_trait]
    impl ClusterApi for EmptyCluster {
        async fn service_selector(&self, _: &str, _: &str) -> Result<BTreeMap<String, String>> {
            Ok(BTreeMap::from([("app".to_string(), "web".to_string())]))
        }

        async fn list_pods(&self, _: &str, _: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            instance: "i-0abc".into(),
            region: "eu-west-1".into(),
            profile: Some("prod".into()),
            role_arn: None,
            target_host: "db".into(),
            target_port: 5432,
            local_port: 15432,
            plugin: None,
        }
    }

    fn failing_options(dir: &std::path::Path) -> LaunchOptions {
        LaunchOptions::new(std::process::id())
            .with_program(dir.join("missing-binary"))
            .with_log_dir(dir)
            .with_grace(Duration::from_millis(10))
    }

    #[test]
    fn test_prepare_resolves_port() {
        let config = TunnelConfig::Ssh(SshConfig {
            local_host: "127.0.0.1".into(),
            local_port: 0,
            bastion_host: "bastion".into(),
            bastion_port: 22,
            user: "ops".into(),
            credential: SshCredential::Password {
                password: "pw".into(),
            },
            target_host: "db".into(),
            target_port: 5432,
        });
        let prepared = prepare(config).unwrap();
        assert_ne!(prepared.local_port(), 0);
    }

    #[test]
    fn test_prepare_rejects_invalid_config() {
        let mut config = session_config();
        config.instance = String::new();
        let err = prepare(TunnelConfig::Session(config)).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[tokio::test]
    async fn test_session_rolled_back_when_worker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FakeBroker::default();
        let lifecycle = Lifecycle::starting_at(TunnelState::Starting);

        let err = open_session(&lifecycle, &broker, session_config(), &failing_options(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::TunnelStart { .. }));
        assert_eq!(*broker.terminated.lock().unwrap(), vec!["sess-1".to_string()]);
    }

    #[tokio::test]
    async fn test_no_pods_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Lifecycle::starting_at(TunnelState::Starting);
        let config = ClusterConfig {
            local_host: "localhost".into(),
            local_port: 18080,
            namespace: "shop".into(),
            service: "web".into(),
            target_port: 80,
            access: ClusterAccess::default(),
        };

        let err = open_cluster(&lifecycle, &EmptyCluster, config, &failing_options(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NoPodsFound { .. }));
        // no log file means no fork attempt
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_handle_json_shape() {
        let handle = TunnelHandle {
            local_host: "localhost".into(),
            local_port: 15432,
            pid: 4242,
            log_path: PathBuf::from("/tmp/ssh-tunnel-db-5432.log"),
            session: None,
        };
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["local_port"], 15432);
        assert!(json.get("session").is_none());
        let back: TunnelHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, handle);
    }
}
