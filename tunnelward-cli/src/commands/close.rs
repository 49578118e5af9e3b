//! Close subcommand implementation

use anyhow::{bail, Context, Result};
use clap::Args;
use tunnelward_core::{close_tunnel, SessionRecord, SessionRegistry};
use tunnelward_observability::init_minimal_logging;

#[derive(Args, Debug)]
pub struct CloseArgs {
    /// Pid of the tunnel process
    #[arg(long)]
    pub pid: u32,

    /// Remote session to terminate as well
    #[arg(long)]
    pub session_id: Option<String>,

    /// Region of the remote session
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Shared config profile
    #[arg(long, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// Role to assume before terminating the session
    #[arg(long, env = "TUNNELWARD_SSM_ROLE_ARN")]
    pub role_arn: Option<String>,
}

impl CloseArgs {
    fn session(&self) -> Result<Option<SessionRecord>> {
        let Some(session_id) = &self.session_id else {
            return Ok(None);
        };
        let Some(region) = &self.region else {
            bail!("--region is required with --session-id");
        };
        Ok(Some(SessionRecord {
            session_id: session_id.clone(),
            region: region.clone(),
            profile: self.profile.clone(),
            role_arn: self.role_arn.clone(),
        }))
    }
}

pub async fn run(args: CloseArgs) -> Result<()> {
    init_minimal_logging();
    let session = args.session()?;
    let registry = match &session {
        Some(record) => SessionRegistry::for_record(record),
        None => SessionRegistry::aws(args.profile.clone(), args.role_arn.clone()),
    };
    close_tunnel(args.pid, session.as_ref(), &registry)
        .await
        .with_context(|| format!("failed to close tunnel {}", args.pid))
}
