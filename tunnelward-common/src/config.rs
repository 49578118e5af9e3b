//! Tunnel configuration model
//!
//! A [`TunnelConfig`] holds exactly one backend variant. It is built by the
//! front end, validated, and (after the local port is resolved) carried across
//! the process boundary to the worker.

use crate::constants::{DEFAULT_LOCAL_HOST, DEFAULT_SSH_PORT};
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Role marker identifying a backend across the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Ssh,
    Session,
    Cluster,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Ssh => "ssh",
            BackendKind::Session => "ssm",
            BackendKind::Cluster => "kubernetes",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ssh" => Ok(BackendKind::Ssh),
            "ssm" => Ok(BackendKind::Session),
            "kubernetes" => Ok(BackendKind::Cluster),
            other => Err(TunnelError::Config(format!("unknown tunnel type: {other}"))),
        }
    }
}

/// Tunnel configuration, one variant per backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TunnelConfig {
    #[serde(rename = "ssh")]
    Ssh(SshConfig),
    #[serde(rename = "ssm")]
    Session(SessionConfig),
    #[serde(rename = "kubernetes")]
    Cluster(ClusterConfig),
}

impl TunnelConfig {
    /// Host the local listener binds to.
    pub fn local_host(&self) -> &str {
        match self {
            TunnelConfig::Ssh(c) => &c.local_host,
            // fixed by the session plugin
            TunnelConfig::Session(_) => DEFAULT_LOCAL_HOST,
            TunnelConfig::Cluster(c) => &c.local_host,
        }
    }

    pub fn local_port(&self) -> u16 {
        match self {
            TunnelConfig::Ssh(c) => c.local_port,
            TunnelConfig::Session(c) => c.local_port,
            TunnelConfig::Cluster(c) => c.local_port,
        }
    }

    pub fn set_local_port(&mut self, port: u16) {
        match self {
            TunnelConfig::Ssh(c) => c.local_port = port,
            TunnelConfig::Session(c) => c.local_port = port,
            TunnelConfig::Cluster(c) => c.local_port = port,
        }
    }

    /// Check required fields. Does not require the local port to be resolved.
    pub fn validate(&self) -> Result<()> {
        match self {
            TunnelConfig::Ssh(c) => {
                require("bastion host", &c.bastion_host)?;
                require("ssh user", &c.user)?;
                require("target host", &c.target_host)?;
                require_port("bastion port", c.bastion_port)?;
                require_port("target port", c.target_port)?;
                c.credential.validate()
            }
            TunnelConfig::Session(c) => {
                require("instance", &c.instance)?;
                require("region", &c.region)?;
                require("target host", &c.target_host)?;
                require_port("target port", c.target_port)
            }
            TunnelConfig::Cluster(c) => {
                require("namespace", &c.namespace)?;
                require("service", &c.service)?;
                require("local host", &c.local_host)?;
                require_port("target port", c.target_port)
            }
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TunnelError::Config(format!("{field} is required")));
    }
    Ok(())
}

fn require_port(field: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(TunnelError::Config(format!("{field} must be non-zero")));
    }
    Ok(())
}

fn default_local_host() -> String {
    DEFAULT_LOCAL_HOST.to_string()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Name of the user running this process, used as the default SSH user.
pub fn default_user() -> String {
    whoami::username()
}

/// SSH bastion tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
    pub bastion_host: String,
    #[serde(default = "default_ssh_port")]
    pub bastion_port: u16,
    pub user: String,
    pub credential: SshCredential,
    pub target_host: String,
    pub target_port: u16,
}

/// How the SSH worker authenticates against the bastion.
///
/// Key material is either a path to an existing file or the key text itself.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SshCredential {
    Password { password: String },
    PrivateKey { material: String },
    EncryptedPrivateKey { material: String, passphrase: String },
}

impl SshCredential {
    /// Build a credential from the optional pieces a caller supplies.
    ///
    /// Exactly one of `password` or `key` must be given; a passphrase is only
    /// meaningful with a key.
    pub fn from_parts(
        password: Option<String>,
        key: Option<String>,
        passphrase: Option<String>,
    ) -> Result<Self> {
        match (password, key, passphrase) {
            (Some(_), Some(_), _) => Err(TunnelError::Config(
                "ssh password and private key are mutually exclusive".into(),
            )),
            (Some(_), None, Some(_)) => Err(TunnelError::Config(
                "ssh key passphrase given without a private key".into(),
            )),
            (Some(password), None, None) => Ok(SshCredential::Password { password }),
            (None, Some(material), None) => Ok(SshCredential::PrivateKey { material }),
            (None, Some(material), Some(passphrase)) => {
                Ok(SshCredential::EncryptedPrivateKey {
                    material,
                    passphrase,
                })
            }
            (None, None, _) => Err(TunnelError::Config(
                "either an ssh password or a private key is required".into(),
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            SshCredential::Password { .. } => Ok(()),
            SshCredential::PrivateKey { material }
            | SshCredential::EncryptedPrivateKey { material, .. } => {
                require("ssh private key", material)
            }
        }
    }
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshCredential::Password { .. } => f.write_str("Password(<redacted>)"),
            SshCredential::PrivateKey { .. } => f.write_str("PrivateKey(<redacted>)"),
            SshCredential::EncryptedPrivateKey { .. } => {
                f.write_str("EncryptedPrivateKey(<redacted>)")
            }
        }
    }
}

/// AWS SSM port-forwarding session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub instance: String,
    pub region: String,
    pub profile: Option<String>,
    pub role_arn: Option<String>,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub local_port: u16,
    /// Session plugin executable; `session-manager-plugin` from `PATH` when absent.
    pub plugin: Option<String>,
}

/// Kubernetes service port-forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
    pub namespace: String,
    pub service: String,
    pub target_port: u16,
    #[serde(default)]
    pub access: ClusterAccess,
}

/// Cluster connection settings. Every field is an override on top of the
/// resolved kubeconfig; `None` means "not set", which is distinct from `Some("")`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAccess {
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    pub tls_server_name: Option<String>,
    /// PEM text
    pub client_certificate: Option<String>,
    /// PEM text
    pub client_key: Option<String>,
    /// PEM text
    pub cluster_ca_certificate: Option<String>,
    pub config_paths: Option<Vec<String>>,
    pub config_path: Option<String>,
    pub config_context: Option<String>,
    pub config_context_auth_info: Option<String>,
    pub config_context_cluster: Option<String>,
    pub token: Option<String>,
    pub proxy_url: Option<String>,
    pub exec: Option<ExecCredential>,
}

impl fmt::Debug for ClusterAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterAccess")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("insecure", &self.insecure)
            .field("tls_server_name", &self.tls_server_name)
            .field("config_paths", &self.config_paths)
            .field("config_path", &self.config_path)
            .field("config_context", &self.config_context)
            .field("config_context_auth_info", &self.config_context_auth_info)
            .field("config_context_cluster", &self.config_context_cluster)
            .field("proxy_url", &self.proxy_url)
            .field("exec", &self.exec)
            .finish_non_exhaustive()
    }
}

/// Exec credential plugin invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCredential {
    pub api_version: String,
    pub command: String,
    pub env: Option<BTreeMap<String, String>>,
    pub args: Option<Vec<String>>,
}
