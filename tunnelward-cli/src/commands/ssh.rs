//! SSH subcommand implementation

use super::{print_handle, LaunchArgs};
use anyhow::{Context, Result};
use clap::Args;
use tunnelward_common::constants::{DEFAULT_LOCAL_HOST, DEFAULT_SSH_PORT};
use tunnelward_common::{default_user, SshConfig, SshCredential, TunnelConfig};
use tunnelward_observability::init_minimal_logging;

#[derive(Args, Debug)]
pub struct SshArgs {
    /// Bastion host to connect through
    #[arg(long)]
    pub ssh_host: String,

    /// Bastion SSH port
    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,

    /// Bastion login (defaults to the current user)
    #[arg(long, env = "TUNNELWARD_SSH_USER")]
    pub ssh_user: Option<String>,

    /// Password authentication
    #[arg(long, env = "TUNNELWARD_SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// Private key: a file path or inline PEM
    #[arg(long, env = "TUNNELWARD_SSH_KEY", hide_env_values = true)]
    pub ssh_key: Option<String>,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "TUNNELWARD_SSH_KEY_PASSPHRASE", hide_env_values = true)]
    pub ssh_key_passphrase: Option<String>,

    /// Host to reach from the bastion
    #[arg(long)]
    pub target_host: String,

    /// Port to reach from the bastion
    #[arg(long)]
    pub target_port: u16,

    /// Local address to listen on
    #[arg(long, default_value = DEFAULT_LOCAL_HOST)]
    pub local_host: String,

    /// Local port to listen on (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    pub local_port: u16,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

impl SshArgs {
    fn into_config(self) -> Result<(TunnelConfig, LaunchArgs)> {
        let credential =
            SshCredential::from_parts(self.ssh_password, self.ssh_key, self.ssh_key_passphrase)?;
        let config = SshConfig {
            local_host: self.local_host,
            local_port: self.local_port,
            bastion_host: self.ssh_host,
            bastion_port: self.ssh_port,
            user: self.ssh_user.unwrap_or_else(default_user),
            credential,
            target_host: self.target_host,
            target_port: self.target_port,
        };
        Ok((TunnelConfig::Ssh(config), self.launch))
    }
}

pub async fn run(args: SshArgs) -> Result<()> {
    init_minimal_logging();
    let (config, launch) = args.into_config()?;
    let handle = tunnelward_core::open(config, &launch.options()?)
        .await
        .context("failed to open ssh tunnel")?;
    print_handle(&handle)
}
