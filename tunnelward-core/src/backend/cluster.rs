//! Kubernetes port-forward backend
//!
//! Pre-flight resolves a service to one backing pod in the front end; the
//! worker opens a port-forward to that pod for every local connection.

use super::{bind_local, fatal_channel, fatal_error, serve, FatalSender, ForwardingEngine};
use crate::state::{Lifecycle, TunnelState};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};
use tunnelward_common::{ClusterAccess, ClusterConfig, Result, TunnelError};

/// Name given to cluster, user and context entries synthesized from explicit settings.
const SYNTHETIC_ENTRY: &str = "tunnelward";

/// Worker payload: the config plus the pod chosen during pre-flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterWorker {
    pub config: ClusterConfig,
    pub pod: String,
}

/// The cluster queries pre-flight needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn service_selector(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<BTreeMap<String, String>>;

    /// Pod names matching `selector`, in API order.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>>;
}

/// `k1=v1,k2=v2`
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pick the pod backing the configured service.
pub async fn preflight(api: &dyn ClusterApi, config: &ClusterConfig) -> Result<ClusterWorker> {
    let selector = api
        .service_selector(&config.namespace, &config.service)
        .await?;
    if selector.is_empty() {
        return Err(TunnelError::Preflight(format!(
            "service {}/{} has no selector",
            config.namespace, config.service
        )));
    }

    let selector = selector_string(&selector);
    let pods = api.list_pods(&config.namespace, &selector).await?;
    debug!("Selector {} matched {} pod(s)", selector, pods.len());
    let pod = pods
        .into_iter()
        .next()
        .ok_or_else(|| TunnelError::NoPodsFound {
            namespace: config.namespace.clone(),
            service: config.service.clone(),
        })?;

    info!(
        "Service {}/{} resolved to pod {}",
        config.namespace, config.service, pod
    );
    Ok(ClusterWorker {
        config: config.clone(),
        pod,
    })
}

fn load_kubeconfig(access: &ClusterAccess) -> Result<Option<Kubeconfig>> {
    let read = |path: &str| {
        Kubeconfig::read_from(path)
            .map_err(|e| TunnelError::Config(format!("cannot read kubeconfig {path}: {e}")))
    };

    match (&access.config_paths, &access.config_path) {
        (Some(paths), _) if !paths.is_empty() => {
            let mut merged: Option<Kubeconfig> = None;
            for path in paths {
                let next = read(path)?;
                merged = Some(match merged {
                    Some(acc) => acc
                        .merge(next)
                        .map_err(|e| TunnelError::Config(format!("cannot merge {path}: {e}")))?,
                    None => next,
                });
            }
            Ok(merged)
        }
        (_, Some(path)) => read(path).map(Some),
        // default location is optional
        _ => Ok(Kubeconfig::read().ok()),
    }
}

fn named_entry<'a>(
    doc: &'a mut Value,
    list: &str,
    name: &str,
    body: &str,
) -> Option<&'a mut Map<String, Value>> {
    if !doc[list].is_array() {
        doc[list] = json!([]);
    }
    let entries = doc[list].as_array_mut()?;
    let index = match entries.iter().position(|e| e["name"] == name) {
        Some(i) => i,
        None => {
            entries.push(json!({ "name": name, body: {} }));
            entries.len() - 1
        }
    };
    let entry = &mut entries[index];
    if !entry[body].is_object() {
        entry[body] = json!({});
    }
    entry[body].as_object_mut()
}

fn set_opt(map: &mut Map<String, Value>, key: &str, value: Option<&String>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::String(v.clone()));
    }
}

fn set_pem(map: &mut Map<String, Value>, key: &str, pem: Option<&String>) {
    if let Some(pem) = pem {
        map.insert(key.to_string(), Value::String(STANDARD.encode(pem)));
    }
}

fn has_cluster_overrides(access: &ClusterAccess) -> bool {
    access.host.is_some()
        || access.insecure
        || access.tls_server_name.is_some()
        || access.cluster_ca_certificate.is_some()
        || access.proxy_url.is_some()
}

fn has_user_overrides(access: &ClusterAccess) -> bool {
    access.token.is_some()
        || access.username.is_some()
        || access.password.is_some()
        || access.client_certificate.is_some()
        || access.client_key.is_some()
        || access.exec.is_some()
}

/// Apply explicit settings on top of a kubeconfig document.
///
/// Overrides land on the cluster and user of the selected context. A document
/// without any usable context gets a synthetic one.
pub fn patch_kubeconfig(doc: &mut Value, access: &ClusterAccess) {
    if !has_cluster_overrides(access) && !has_user_overrides(access) {
        return;
    }

    let context_name = access
        .config_context
        .clone()
        .or_else(|| doc["current-context"].as_str().map(str::to_string));
    let context = context_name.as_deref().and_then(|name| {
        doc["contexts"]
            .as_array()
            .and_then(|list| list.iter().find(|c| c["name"] == name))
            .map(|c| c["context"].clone())
    });

    let (cluster_name, user_name) = match context {
        Some(ctx) => (
            access
                .config_context_cluster
                .clone()
                .or_else(|| ctx["cluster"].as_str().map(str::to_string)),
            access
                .config_context_auth_info
                .clone()
                .or_else(|| ctx["user"].as_str().map(str::to_string)),
        ),
        None => {
            let cluster = access
                .config_context_cluster
                .clone()
                .unwrap_or_else(|| SYNTHETIC_ENTRY.to_string());
            let user = access
                .config_context_auth_info
                .clone()
                .unwrap_or_else(|| SYNTHETIC_ENTRY.to_string());
            let name = context_name.unwrap_or_else(|| SYNTHETIC_ENTRY.to_string());
            if let Some(ctx) = named_entry(doc, "contexts", &name, "context") {
                ctx.insert("cluster".into(), Value::String(cluster.clone()));
                ctx.insert("user".into(), Value::String(user.clone()));
            }
            if doc["current-context"].as_str().is_none_or(str::is_empty) {
                doc["current-context"] = Value::String(name);
            }
            (Some(cluster), Some(user))
        }
    };

    let cluster = match cluster_name {
        Some(name) if has_cluster_overrides(access) => named_entry(doc, "clusters", &name, "cluster"),
        _ => None,
    };
    if let Some(cluster) = cluster {
        set_opt(cluster, "server", access.host.as_ref());
        if access.insecure {
            cluster.insert("insecure-skip-tls-verify".into(), Value::Bool(true));
        }
        set_opt(cluster, "tls-server-name", access.tls_server_name.as_ref());
        set_pem(
            cluster,
            "certificate-authority-data",
            access.cluster_ca_certificate.as_ref(),
        );
        set_opt(cluster, "proxy-url", access.proxy_url.as_ref());
    }

    let user = match user_name {
        Some(name) if has_user_overrides(access) => named_entry(doc, "users", &name, "user"),
        _ => None,
    };
    if let Some(user) = user {
        set_opt(user, "token", access.token.as_ref());
        set_opt(user, "username", access.username.as_ref());
        set_opt(user, "password", access.password.as_ref());
        set_pem(
            user,
            "client-certificate-data",
            access.client_certificate.as_ref(),
        );
        set_pem(user, "client-key-data", access.client_key.as_ref());
        if let Some(exec) = &access.exec {
            let env: Vec<Value> = exec
                .env
                .iter()
                .flatten()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect();
            let mut exec_json = json!({
                "apiVersion": exec.api_version,
                "command": exec.command,
                "interactiveMode": "IfAvailable",
            });
            if let Some(args) = &exec.args {
                exec_json["args"] = json!(args);
            }
            if exec.env.is_some() {
                exec_json["env"] = Value::Array(env);
            }
            user.insert("exec".into(), exec_json);
        }
    }
}

/// Build the client configuration from kubeconfig files and explicit settings.
///
/// Without a kubeconfig and without an explicit host, falls back to in-cluster
/// and environment inference.
pub async fn client_config(access: &ClusterAccess) -> Result<Config> {
    let loaded = load_kubeconfig(access)?;
    if loaded.is_none() && access.host.is_none() {
        debug!("No kubeconfig found, inferring cluster configuration");
        return Config::infer()
            .await
            .map_err(|e| TunnelError::Config(format!("cannot infer cluster configuration: {e}")));
    }

    let kubeconfig = loaded.unwrap_or_default();
    let mut doc = serde_json::to_value(&kubeconfig)
        .map_err(|e| TunnelError::Config(format!("cannot process kubeconfig: {e}")))?;
    patch_kubeconfig(&mut doc, access);
    let kubeconfig: Kubeconfig = serde_json::from_value(doc)
        .map_err(|e| TunnelError::Config(format!("invalid cluster settings: {e}")))?;

    let options = KubeConfigOptions {
        context: access.config_context.clone(),
        cluster: access.config_context_cluster.clone(),
        user: access.config_context_auth_info.clone(),
    };
    Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| TunnelError::Config(format!("invalid kubeconfig: {e}")))
}

/// [`ClusterApi`] backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub async fn connect(access: &ClusterAccess) -> Result<Self> {
        let config = client_config(access).await?;
        debug!("Using API server {}", config.cluster_url);
        let client = Client::try_from(config)
            .map_err(|e| TunnelError::Config(format!("cannot create cluster client: {e}")))?;
        Ok(Self { client })
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn service_selector(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<BTreeMap<String, String>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = services.get(service).await.map_err(|e| {
            TunnelError::Preflight(format!("cannot get service {namespace}/{service}: {e}"))
        })?;
        Ok(svc.spec.and_then(|s| s.selector).unwrap_or_default())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| {
                TunnelError::Preflight(format!("cannot list pods in {namespace}: {e}"))
            })?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }
}

pub struct ClusterEngine {
    worker: ClusterWorker,
}

impl ClusterEngine {
    pub fn new(worker: ClusterWorker) -> Self {
        Self { worker }
    }
}

/// Error if `pod` can no longer serve traffic or the API server is unreachable.
async fn check_pod(pods: &Api<Pod>, pod: &str) -> Result<()> {
    let found = pods
        .get_opt(pod)
        .await
        .map_err(|e| TunnelError::Engine(format!("cannot reach the API server: {e}")))?;
    let Some(found) = found else {
        return Err(TunnelError::Engine(format!("pod {pod} no longer exists")));
    };
    if found.metadata.deletion_timestamp.is_some() {
        return Err(TunnelError::Engine(format!("pod {pod} is terminating")));
    }
    let phase = found.status.and_then(|s| s.phase);
    match phase.as_deref() {
        Some(p @ ("Succeeded" | "Failed")) => {
            Err(TunnelError::Engine(format!("pod {pod} has stopped ({p})")))
        }
        _ => Ok(()),
    }
}

async fn forward(
    pods: Api<Pod>,
    pod: String,
    port: u16,
    mut local: TcpStream,
    peer: SocketAddr,
    fatal: FatalSender,
) -> Result<()> {
    let mut forwarder = match pods.portforward(&pod, &[port]).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            // a pod that is still there means the failure was transient
            if let Err(gone) = check_pod(&pods, &pod).await {
                let _ = fatal.try_send(gone);
            }
            return Err(TunnelError::Engine(format!(
                "port-forward to {pod}:{port} failed: {e}"
            )));
        }
    };
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| TunnelError::Engine(format!("no stream for port {port} on {pod}")))?;

    let (up, down) = tokio::io::copy_bidirectional(&mut local, &mut upstream).await?;
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| TunnelError::Engine(format!("port-forward to {pod}:{port} ended badly: {e}")))?;
    debug!("Connection from {} closed ({} up, {} down)", peer, up, down);
    Ok(())
}

#[async_trait]
impl ForwardingEngine for ClusterEngine {
    async fn run(
        self: Box<Self>,
        lifecycle: Lifecycle,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let config = &self.worker.config;
        let cluster = KubeCluster::connect(&config.access).await?;
        let pods = cluster.pods(&config.namespace);

        let listener = bind_local(&config.local_host, config.local_port).await?;
        lifecycle.transition(TunnelState::Running)?;
        info!(
            "Forwarding {}:{} -> {}/{}:{}",
            config.local_host, config.local_port, config.namespace, self.worker.pod, config.target_port
        );

        let pod = self.worker.pod.clone();
        let port = config.target_port;
        let (fatal_tx, fatal_rx) = fatal_channel();
        serve(
            listener,
            &lifecycle,
            shutdown,
            fatal_error(fatal_rx),
            move |stream, peer| {
                forward(
                    pods.clone(),
                    pod.clone(),
                    port,
                    stream,
                    peer,
                    fatal_tx.clone(),
                )
            },
        )
        .await
    }
}
