//! AWS SSM port-forwarding backend
//!
//! The front end starts the session through the SSM API; the worker hands the
//! session to `session-manager-plugin`, which owns the local listener.

use super::{shutdown_signalled, ForwardingEngine};
use crate::process;
use crate::state::{Lifecycle, TunnelState};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ssm::error::DisplayErrorContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{info, warn};
use tunnelward_common::constants::{
    DEFAULT_SSM_PLUGIN, DRAIN_TIMEOUT, SSM_PORT_FORWARD_DOCUMENT, SSM_RESPONSE_ENV,
};
use tunnelward_common::{Result, SessionConfig, TunnelError};

const ASSUME_ROLE_SESSION_NAME: &str = "tunnelward";

/// Session data returned by `StartSession`, in the shape the plugin expects.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteSession {
    pub session_id: String,
    pub token_value: String,
    pub stream_url: String,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("session_id", &self.session_id)
            .field("token_value", &"<redacted>")
            .field("stream_url", &self.stream_url)
            .finish()
    }
}

/// `StartSession` request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInput {
    pub target: String,
    pub document_name: String,
    pub parameters: BTreeMap<String, Vec<String>>,
}

impl SessionInput {
    pub fn for_config(config: &SessionConfig) -> Self {
        let parameters = BTreeMap::from([
            ("portNumber".to_string(), vec![config.target_port.to_string()]),
            (
                "localPortNumber".to_string(),
                vec![config.local_port.to_string()],
            ),
            ("host".to_string(), vec![config.target_host.clone()]),
        ]);
        Self {
            target: config.instance.clone(),
            document_name: SSM_PORT_FORWARD_DOCUMENT.to_string(),
            parameters,
        }
    }
}

/// Worker payload: the config plus the already-started session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWorker {
    pub config: SessionConfig,
    pub session: RemoteSession,
}

/// Starts and terminates remote sessions.
#[async_trait]
pub trait SessionBroker: Send + Sync {
    async fn start_session(&self, input: &SessionInput) -> Result<RemoteSession>;
    async fn terminate_session(&self, session_id: &str) -> Result<()>;
}

/// [`SessionBroker`] backed by the AWS SSM API.
pub struct SsmBroker {
    client: aws_sdk_ssm::Client,
}

impl SsmBroker {
    /// Resolve credentials for `region`, optionally from a shared profile and
    /// through an assumed role.
    pub async fn connect(region: &str, profile: Option<&str>, role_arn: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let sdk = loader.load().await;

        let client = match role_arn {
            Some(arn) => {
                info!("Assuming role {}", arn);
                let provider = aws_config::sts::AssumeRoleProvider::builder(arn)
                    .session_name(ASSUME_ROLE_SESSION_NAME)
                    .configure(&sdk)
                    .build()
                    .await;
                let conf = aws_sdk_ssm::config::Builder::from(&sdk)
                    .credentials_provider(provider)
                    .build();
                aws_sdk_ssm::Client::from_conf(conf)
            }
            None => aws_sdk_ssm::Client::new(&sdk),
        };
        Self { client }
    }
}

#[async_trait]
impl SessionBroker for SsmBroker {
    async fn start_session(&self, input: &SessionInput) -> Result<RemoteSession> {
        let out = self
            .client
            .start_session()
            .target(&input.target)
            .document_name(&input.document_name)
            .set_parameters(Some(input.parameters.clone().into_iter().collect()))
            .send()
            .await
            .map_err(|e| TunnelError::Preflight(DisplayErrorContext(&e).to_string()))?;

        let field = |value: Option<&str>, name: &str| {
            value
                .map(str::to_string)
                .ok_or_else(|| TunnelError::Preflight(format!("StartSession returned no {name}")))
        };
        Ok(RemoteSession {
            session_id: field(out.session_id(), "SessionId")?,
            token_value: field(out.token_value(), "TokenValue")?,
            stream_url: field(out.stream_url(), "StreamUrl")?,
        })
    }

    async fn terminate_session(&self, session_id: &str) -> Result<()> {
        self.client
            .terminate_session()
            .session_id(session_id)
            .send()
            .await
            .map_err(|e| TunnelError::Teardown(vec![DisplayErrorContext(&e).to_string()]))?;
        Ok(())
    }
}

/// Start the remote session that the worker will attach to.
pub async fn preflight(broker: &dyn SessionBroker, config: &SessionConfig) -> Result<SessionWorker> {
    let input = SessionInput::for_config(config);
    let session = broker.start_session(&input).await.map_err(|e| match e {
        TunnelError::Preflight(_) => e,
        other => TunnelError::Preflight(other.to_string()),
    })?;
    info!(
        "Started session {} to {} via {}",
        session.session_id, config.target_host, config.instance
    );
    Ok(SessionWorker {
        config: config.clone(),
        session,
    })
}

/// Public SSM endpoint for `region`.
pub fn endpoint_for(region: &str) -> String {
    if region.starts_with("cn-") {
        format!("https://ssm.{region}.amazonaws.com.cn")
    } else {
        format!("https://ssm.{region}.amazonaws.com")
    }
}

/// Positional arguments of the session plugin. The session response itself
/// is read from [`SSM_RESPONSE_ENV`].
pub fn plugin_args(worker: &SessionWorker) -> Result<Vec<String>> {
    let input = serde_json::to_string(&SessionInput::for_config(&worker.config))
        .map_err(|e| TunnelError::Engine(format!("cannot encode session input: {e}")))?;
    Ok(vec![
        SSM_RESPONSE_ENV.to_string(),
        worker.config.region.clone(),
        "StartSession".to_string(),
        worker.config.profile.clone().unwrap_or_default(),
        input,
        endpoint_for(&worker.config.region),
    ])
}

pub struct SessionEngine {
    worker: SessionWorker,
}

impl SessionEngine {
    pub fn new(worker: SessionWorker) -> Self {
        Self { worker }
    }

    fn spawn_plugin(&self) -> Result<Child> {
        let program = self
            .worker
            .config
            .plugin
            .clone()
            .unwrap_or_else(|| DEFAULT_SSM_PLUGIN.to_string());
        let response = serde_json::to_string(&self.worker.session)
            .map_err(|e| TunnelError::Engine(format!("cannot encode session response: {e}")))?;

        Command::new(&program)
            .args(plugin_args(&self.worker)?)
            .env(SSM_RESPONSE_ENV, response)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Engine(format!("cannot start {program}: {e}")))
    }
}

async fn stop_plugin(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = process::interrupt(pid) {
            warn!("Cannot interrupt session plugin {}: {}", pid, e);
        }
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await.is_err() {
        warn!("Session plugin ignored interrupt, killing it");
        if let Err(e) = child.kill().await {
            warn!("Cannot kill session plugin: {}", e);
        }
    }
}

#[async_trait]
impl ForwardingEngine for SessionEngine {
    async fn run(
        self: Box<Self>,
        lifecycle: Lifecycle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut child = self.spawn_plugin()?;
        lifecycle.transition(TunnelState::Running)?;
        info!(
            "Session {} forwarding localhost:{} -> {}:{}",
            self.worker.session.session_id,
            self.worker.config.local_port,
            self.worker.config.target_host,
            self.worker.config.target_port
        );

        let exited = tokio::select! {
            status = child.wait() => Some(status?),
            () = shutdown_signalled(&mut shutdown) => None,
        };
        lifecycle.begin_close();

        match exited {
            Some(status) if status.success() => {
                info!("Session plugin exited");
                Ok(())
            }
            Some(status) => Err(TunnelError::Engine(format!(
                "session plugin exited with {status}"
            ))),
            None => {
                stop_plugin(&mut child).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) fn config() -> SessionConfig {
        SessionConfig {
            instance: "i-0abc".into(),
            region: "eu-west-1".into(),
            profile: None,
            role_arn: None,
            target_host: "db.internal".into(),
            target_port: 5432,
            local_port: 15432,
            plugin: None,
        }
    }

    fn session() -> RemoteSession {
        RemoteSession {
            session_id: "sess-1".into(),
            token_value: "secret-token".into(),
            stream_url: "wss://ssmmessages.eu-west-1.amazonaws.com/v1/data-channel/sess-1".into(),
        }
    }

    #[derive(Default)]
    struct FakeBroker {
        inputs: Mutex<Vec<SessionInput>>,
        fail: bool,
    }

    #[async_trait]
    impl SessionBroker for FakeBroker {
        async fn start_session(&self, input: &SessionInput) -> Result<RemoteSession> {
            self.inputs.lock().unwrap().push(input.clone());
            if self.fail {
                return Err(TunnelError::Io(std::io::Error::other("denied")));
            }
            Ok(session())
        }

        async fn terminate_session(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_session_input_parameters() {
        let input = SessionInput::for_config(&config());
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["Target"], "i-0abc");
        assert_eq!(json["DocumentName"], SSM_PORT_FORWARD_DOCUMENT);
        assert_eq!(json["Parameters"]["portNumber"][0], "5432");
        assert_eq!(json["Parameters"]["localPortNumber"][0], "15432");
        assert_eq!(json["Parameters"]["host"][0], "db.internal");
    }

    #[test]
    fn test_endpoint_for_region() {
        assert_eq!(endpoint_for("eu-west-1"), "https://ssm.eu-west-1.amazonaws.com");
        assert_eq!(
            endpoint_for("cn-north-1"),
            "https://ssm.cn-north-1.amazonaws.com.cn"
        );
    }

    #[test]
    fn test_plugin_args() {
        let mut worker = SessionWorker {
            config: config(),
            session: session(),
        };
        worker.config.profile = Some("prod".into());
        let args = plugin_args(&worker).unwrap();
        assert_eq!(args[0], SSM_RESPONSE_ENV);
        assert_eq!(args[1], "eu-west-1");
        assert_eq!(args[2], "StartSession");
        assert_eq!(args[3], "prod");
        assert!(args[4].contains("\"Target\":\"i-0abc\""));
        assert_eq!(args[5], "https://ssm.eu-west-1.amazonaws.com");
    }

    #[test]
    fn test_remote_session_wire_shape_and_redaction() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["SessionId"], "sess-1");
        assert_eq!(json["TokenValue"], "secret-token");
        assert!(!format!("{:?}", session()).contains("secret-token"));
    }

    #[tokio::test]
    async fn test_preflight_builds_worker() {
        let broker = FakeBroker::default();
        let worker = preflight(&broker, &config()).await.unwrap();
        assert_eq!(worker.session, session());
        assert_eq!(broker.inputs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_preflight_failure_is_preflight_error() {
        let broker = FakeBroker {
            fail: true,
            ..FakeBroker::default()
        };
        let err = preflight(&broker, &config()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Preflight(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_hands_session_to_plugin_and_stops_it() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("plugin.out");
        let script = dir.path().join("plugin.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$1 $3\" > {out}\necho \"${SSM_RESPONSE_ENV}\" >> {out}\nexec sleep 30\n",
                out = out.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = config();
        cfg.plugin = Some(script.display().to_string());
        let engine = Box::new(SessionEngine::new(SessionWorker {
            config: cfg,
            session: session(),
        }));

        let lifecycle = Lifecycle::starting_at(TunnelState::Ready);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(lifecycle.clone(), rx));

        let mut recorded = String::new();
        for _ in 0..50 {
            recorded = std::fs::read_to_string(&out).unwrap_or_default();
            if recorded.lines().count() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(lifecycle.current(), TunnelState::Running);
        let mut lines = recorded.lines();
        assert_eq!(lines.next(), Some(format!("{SSM_RESPONSE_ENV} StartSession").as_str()));
        let response: RemoteSession = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(response, session());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lifecycle.current(), TunnelState::Closing);
    }

    #[tokio::test]
    async fn test_missing_plugin_is_engine_error() {
        let mut cfg = config();
        cfg.plugin = Some("/nonexistent/session-manager-plugin".into());
        let engine = Box::new(SessionEngine::new(SessionWorker {
            config: cfg,
            session: session(),
        }));
        let (_tx, rx) = watch::channel(false);
        let err = engine
            .run(Lifecycle::starting_at(TunnelState::Ready), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Engine(_)));
    }
}
