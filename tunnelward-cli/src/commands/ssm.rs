//! SSM subcommand implementation

use super::{print_handle, LaunchArgs};
use anyhow::{Context, Result};
use clap::Args;
use tunnelward_common::{SessionConfig, TunnelConfig};
use tunnelward_observability::init_minimal_logging;

#[derive(Args, Debug)]
pub struct SsmArgs {
    /// Managed instance id to start the session on
    #[arg(long)]
    pub instance: String,

    /// AWS region
    #[arg(long, env = "AWS_REGION")]
    pub region: String,

    /// Shared config profile
    #[arg(long, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// Role to assume before starting the session
    #[arg(long, env = "TUNNELWARD_SSM_ROLE_ARN")]
    pub role_arn: Option<String>,

    /// Host to reach from the instance
    #[arg(long, default_value = "localhost")]
    pub target_host: String,

    /// Port to reach from the instance
    #[arg(long)]
    pub target_port: u16,

    /// Local port to listen on (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    pub local_port: u16,

    /// session-manager-plugin executable
    #[arg(long, env = "TUNNELWARD_SSM_PLUGIN")]
    pub plugin: Option<String>,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

impl SsmArgs {
    fn into_config(self) -> (TunnelConfig, LaunchArgs) {
        let config = SessionConfig {
            instance: self.instance,
            region: self.region,
            profile: self.profile,
            role_arn: self.role_arn,
            target_host: self.target_host,
            target_port: self.target_port,
            local_port: self.local_port,
            plugin: self.plugin,
        };
        (TunnelConfig::Session(config), self.launch)
    }
}

pub async fn run(args: SsmArgs) -> Result<()> {
    init_minimal_logging();
    let (config, launch) = args.into_config();
    let handle = tunnelward_core::open(config, &launch.options()?)
        .await
        .context("failed to open ssm tunnel")?;
    print_handle(&handle)
}
