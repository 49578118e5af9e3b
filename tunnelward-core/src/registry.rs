//! Remote session bookkeeping and tunnel teardown

use crate::backend::session::{SessionBroker, SsmBroker};
use crate::process;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use tunnelward_common::{Result, TunnelError};

/// Where a remote session lives, as returned to the caller on open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
}

enum BrokerSource {
    Aws {
        profile: Option<String>,
        role_arn: Option<String>,
    },
    Fixed(Arc<dyn SessionBroker>),
}

/// Terminates remote sessions on the broker that issued them.
pub struct SessionRegistry {
    source: BrokerSource,
}

impl SessionRegistry {
    /// Registry talking to AWS SSM with the given credentials.
    pub fn aws(profile: Option<String>, role_arn: Option<String>) -> Self {
        Self {
            source: BrokerSource::Aws { profile, role_arn },
        }
    }

    pub fn for_record(record: &SessionRecord) -> Self {
        Self::aws(record.profile.clone(), record.role_arn.clone())
    }

    /// Registry using one broker regardless of region.
    pub fn with_broker(broker: Arc<dyn SessionBroker>) -> Self {
        Self {
            source: BrokerSource::Fixed(broker),
        }
    }

    pub async fn terminate(&self, session_id: &str, region: &str) -> Result<()> {
        let broker: Arc<dyn SessionBroker> = match &self.source {
            BrokerSource::Aws { profile, role_arn } => Arc::new(
                SsmBroker::connect(region, profile.as_deref(), role_arn.as_deref()).await,
            ),
            BrokerSource::Fixed(broker) => broker.clone(),
        };
        broker.terminate_session(session_id).await?;
        info!("Terminated session {} in {}", session_id, region);
        Ok(())
    }
}

/// Stop a tunnel worker and, if it carried one, its remote session.
///
/// Both steps are always attempted; failures are reported together. A worker
/// that is already gone counts as stopped.
pub async fn close_tunnel(
    pid: u32,
    session: Option<&SessionRecord>,
    registry: &SessionRegistry,
) -> Result<()> {
    let mut failures = Vec::new();

    match process::interrupt(pid) {
        Ok(()) => info!("Interrupted tunnel process {}", pid),
        Err(TunnelError::ProcessNotFound(_)) => warn!("Tunnel process {} already gone", pid),
        Err(e) => failures.push(format!("cannot interrupt tunnel process {pid}: {e}")),
    }

    if let Some(record) = session {
        match registry.terminate(&record.session_id, &record.region).await {
            Ok(()) => {}
            Err(TunnelError::Teardown(messages)) => failures.extend(
                messages
                    .into_iter()
                    .map(|m| format!("cannot terminate session {}: {m}", record.session_id)),
            ),
            Err(e) => failures.push(format!(
                "cannot terminate session {}: {e}",
                record.session_id
            )),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(TunnelError::Teardown(failures))
    }
}
