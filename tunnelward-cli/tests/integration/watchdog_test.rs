//! Parent supervision and close flows of a session worker

use super::{get_free_port, tunnelward_bin, wait_for_exit, write_script};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tunnelward_common::SessionConfig;
use tunnelward_core::backend::session::{RemoteSession, SessionWorker};
use tunnelward_core::{close_tunnel, fork, LaunchOptions, SessionRegistry, WorkerPayload};

fn session_payload(plugin: &Path) -> WorkerPayload {
    WorkerPayload::Session(SessionWorker {
        config: SessionConfig {
            instance: "i-0123456789abcdef0".into(),
            region: "eu-west-1".into(),
            profile: None,
            role_arn: None,
            target_host: "db.internal".into(),
            target_port: 5432,
            local_port: get_free_port(),
            plugin: Some(plugin.display().to_string()),
        },
        session: RemoteSession {
            session_id: "sess-test".into(),
            token_value: "token".into(),
            stream_url: "wss://ssmmessages.eu-west-1.amazonaws.com/v1/data-channel/sess-test".into(),
        },
    })
}

#[tokio::test]
async fn test_worker_exits_when_watched_process_dies() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = write_script(dir.path(), "plugin.sh", "exec sleep 300");
    let mut parent = Command::new("sleep")
        .arg("300")
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    let options = LaunchOptions::new(parent.id())
        .with_program(tunnelward_bin())
        .with_log_dir(dir.path())
        .with_grace(Duration::from_secs(1));
    let mut worker = fork(&session_payload(&plugin), &options).await.unwrap();
    assert!(worker.log_path.starts_with(dir.path()));

    parent.kill().unwrap();
    parent.wait().unwrap();

    let status = wait_for_exit(&mut worker.child, Duration::from_secs(15)).await;
    assert!(status.is_some(), "worker outlived its watched process");

    let log = std::fs::read_to_string(&worker.log_path).unwrap();
    assert!(log.contains("sess-test"));
}

#[tokio::test]
async fn test_close_interrupts_worker() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = write_script(dir.path(), "plugin.sh", "exec sleep 300");

    let options = LaunchOptions::new(std::process::id())
        .with_program(tunnelward_bin())
        .with_log_dir(dir.path())
        .with_grace(Duration::from_secs(1));
    let mut worker = fork(&session_payload(&plugin), &options).await.unwrap();

    close_tunnel(worker.pid, None, &SessionRegistry::aws(None, None))
        .await
        .unwrap();

    let status = wait_for_exit(&mut worker.child, Duration::from_secs(10))
        .await
        .expect("worker ignored the interrupt");
    assert!(status.success());
}

#[tokio::test]
async fn test_failing_plugin_is_reported_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = write_script(dir.path(), "plugin.sh", "echo 'plugin refused' >&2; exit 3");

    let options = LaunchOptions::new(std::process::id())
        .with_program(tunnelward_bin())
        .with_log_dir(dir.path())
        .with_grace(Duration::from_secs(2));
    let err = fork(&session_payload(&plugin), &options).await.unwrap_err();
    assert!(matches!(
        err,
        tunnelward_common::TunnelError::TunnelStart { .. }
    ));
}
