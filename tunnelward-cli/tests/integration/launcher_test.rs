//! Worker startup through the real binary

use super::{get_free_port, tunnelward_bin};
use std::time::Duration;
use tunnelward_common::{SshConfig, SshCredential, TunnelConfig, TunnelError};
use tunnelward_core::LaunchOptions;

#[tokio::test]
async fn test_unreachable_bastion_reports_start_failure() {
    let log_dir = tempfile::tempdir().unwrap();
    let closed_port = get_free_port();

    let config = TunnelConfig::Ssh(SshConfig {
        local_host: "127.0.0.1".into(),
        local_port: 0,
        bastion_host: "127.0.0.1".into(),
        bastion_port: closed_port,
        user: "ops".into(),
        credential: SshCredential::Password {
            password: "secret".into(),
        },
        target_host: "db.internal".into(),
        target_port: 5432,
    });
    let options = LaunchOptions::new(std::process::id())
        .with_program(tunnelward_bin())
        .with_log_dir(log_dir.path())
        .with_grace(Duration::from_secs(3));

    let err = tunnelward_core::open(config, &options).await.unwrap_err();
    let TunnelError::TunnelStart { log_path, .. } = &err else {
        panic!("expected a start failure, got {err:?}");
    };
    assert!(log_path.starts_with(log_dir.path()));
    assert!(err.to_string().contains(&log_path.display().to_string()));

    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(!log.is_empty());
    assert!(!log.contains("secret"));
}

#[tokio::test]
async fn test_missing_program_reports_start_failure() {
    let log_dir = tempfile::tempdir().unwrap();
    let config = TunnelConfig::Ssh(SshConfig {
        local_host: "127.0.0.1".into(),
        local_port: 0,
        bastion_host: "127.0.0.1".into(),
        bastion_port: 22,
        user: "ops".into(),
        credential: SshCredential::Password {
            password: "pw".into(),
        },
        target_host: "db.internal".into(),
        target_port: 5432,
    });
    let options = LaunchOptions::new(std::process::id())
        .with_program(log_dir.path().join("no-such-binary"))
        .with_log_dir(log_dir.path());

    let err = tunnelward_core::open(config, &options).await.unwrap_err();
    let TunnelError::TunnelStart { log_path, .. } = err else {
        panic!("expected a start failure");
    };
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("cannot spawn"));
}
