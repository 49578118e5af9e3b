//! Kubernetes subcommand implementation

use super::{print_handle, LaunchArgs};
use anyhow::{bail, Context, Result};
use clap::Args;
use std::collections::BTreeMap;
use tunnelward_common::constants::DEFAULT_LOCAL_HOST;
use tunnelward_common::{ClusterAccess, ClusterConfig, ExecCredential, TunnelConfig};
use tunnelward_observability::init_minimal_logging;

const DEFAULT_EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

/// Cluster access flags (flattened into KubernetesArgs)
#[derive(Args, Debug, Default)]
pub struct ClusterAccessArgs {
    /// API server URL
    #[arg(long, env = "KUBE_HOST")]
    pub host: Option<String>,

    /// Basic auth user
    #[arg(long, env = "KUBE_USER")]
    pub username: Option<String>,

    /// Basic auth password
    #[arg(long, env = "KUBE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Skip API server certificate verification
    #[arg(long, env = "KUBE_INSECURE")]
    pub insecure: bool,

    /// Server name to verify the API server certificate against
    #[arg(long, env = "KUBE_TLS_SERVER_NAME")]
    pub tls_server_name: Option<String>,

    /// PEM client certificate
    #[arg(long, env = "KUBE_CLIENT_CERT_DATA", hide_env_values = true)]
    pub client_certificate: Option<String>,

    /// PEM client key
    #[arg(long, env = "KUBE_CLIENT_KEY_DATA", hide_env_values = true)]
    pub client_key: Option<String>,

    /// PEM cluster CA certificate
    #[arg(long, env = "KUBE_CLUSTER_CA_CERT_DATA")]
    pub cluster_ca_certificate: Option<String>,

    /// Kubeconfig files to merge, in path-list form
    #[arg(long, env = "KUBE_CONFIG_PATHS")]
    pub config_paths: Option<String>,

    /// Kubeconfig file
    #[arg(long, env = "KUBE_CONFIG_PATH")]
    pub config_path: Option<String>,

    /// Kubeconfig context
    #[arg(long, env = "KUBE_CTX")]
    pub config_context: Option<String>,

    /// Kubeconfig user overriding the context's
    #[arg(long, env = "KUBE_CTX_AUTH_INFO")]
    pub config_context_auth_info: Option<String>,

    /// Kubeconfig cluster overriding the context's
    #[arg(long, env = "KUBE_CTX_CLUSTER")]
    pub config_context_cluster: Option<String>,

    /// Bearer token
    #[arg(long, env = "KUBE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Proxy for API server traffic
    #[arg(long, env = "KUBE_PROXY_URL")]
    pub proxy_url: Option<String>,

    /// Exec credential plugin command
    #[arg(long)]
    pub exec_command: Option<String>,

    /// Exec credential plugin API version
    #[arg(long, requires = "exec_command")]
    pub exec_api_version: Option<String>,

    /// Exec credential plugin argument (repeatable)
    #[arg(long = "exec-arg", requires = "exec_command")]
    pub exec_args: Vec<String>,

    /// Exec credential plugin environment as KEY=VALUE (repeatable)
    #[arg(long = "exec-env", requires = "exec_command")]
    pub exec_env: Vec<String>,
}

impl ClusterAccessArgs {
    pub fn into_access(self) -> Result<ClusterAccess> {
        let exec = match self.exec_command {
            Some(command) => Some(ExecCredential {
                api_version: self
                    .exec_api_version
                    .unwrap_or_else(|| DEFAULT_EXEC_API_VERSION.to_string()),
                command,
                env: parse_exec_env(&self.exec_env)?,
                args: (!self.exec_args.is_empty()).then_some(self.exec_args),
            }),
            None => None,
        };

        let config_paths = self.config_paths.map(|paths| {
            std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_string_lossy().into_owned())
                .collect()
        });

        Ok(ClusterAccess {
            host: self.host,
            username: self.username,
            password: self.password,
            insecure: self.insecure,
            tls_server_name: self.tls_server_name,
            client_certificate: self.client_certificate,
            client_key: self.client_key,
            cluster_ca_certificate: self.cluster_ca_certificate,
            config_paths,
            config_path: self.config_path,
            config_context: self.config_context,
            config_context_auth_info: self.config_context_auth_info,
            config_context_cluster: self.config_context_cluster,
            token: self.token,
            proxy_url: self.proxy_url,
            exec,
        })
    }
}

fn parse_exec_env(pairs: &[String]) -> Result<Option<BTreeMap<String, String>>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --exec-env {pair:?}, expected KEY=VALUE");
        };
        env.insert(key.to_string(), value.to_string());
    }
    Ok(Some(env))
}

#[derive(Args, Debug)]
pub struct KubernetesArgs {
    /// Namespace of the service
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Service whose pods to forward to
    #[arg(long)]
    pub service: String,

    /// Pod port to forward to
    #[arg(long)]
    pub target_port: u16,

    /// Local address to listen on
    #[arg(long, default_value = DEFAULT_LOCAL_HOST)]
    pub local_host: String,

    /// Local port to listen on (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    pub local_port: u16,

    #[command(flatten)]
    pub access: ClusterAccessArgs,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

impl KubernetesArgs {
    fn into_config(self) -> Result<(TunnelConfig, LaunchArgs)> {
        let config = ClusterConfig {
            local_host: self.local_host,
            local_port: self.local_port,
            namespace: self.namespace,
            service: self.service,
            target_port: self.target_port,
            access: self.access.into_access()?,
        };
        Ok((TunnelConfig::Cluster(config), self.launch))
    }
}

pub async fn run(args: KubernetesArgs) -> Result<()> {
    init_minimal_logging();
    let (config, launch) = args.into_config()?;
    let handle = tunnelward_core::open(config, &launch.options()?)
        .await
        .context("failed to open kubernetes tunnel")?;
    print_handle(&handle)
}
