//! Front-end commands through the real binary

use super::tunnelward_bin;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;

const SERVICE: &str = r#"{"apiVersion":"v1","kind":"Service","metadata":{"name":"web","namespace":"default"},"spec":{"selector":{"app":"web"},"ports":[{"port":80}]}}"#;
const EMPTY_PODS: &str =
    r#"{"apiVersion":"v1","kind":"PodList","metadata":{"resourceVersion":"1"},"items":[]}"#;

/// Answer the two pre-flight requests of a cluster tunnel: one service with a
/// selector, and an empty pod list.
async fn start_fake_api_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);
                let body = if request.starts_with("GET /api/v1/namespaces/default/services/web") {
                    SERVICE
                } else {
                    EMPTY_PODS
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn test_kubernetes_without_pods_fails_before_forking() {
    let api_port = start_fake_api_server().await;
    let log_dir = tempfile::tempdir().unwrap();

    let output = Command::new(tunnelward_bin())
        .args([
            "kubernetes",
            "--namespace",
            "default",
            "--service",
            "web",
            "--target-port",
            "80",
            "--local-host",
            "127.0.0.1",
        ])
        .arg("--log-dir")
        .arg(log_dir.path())
        .env("KUBE_HOST", format!("http://127.0.0.1:{api_port}"))
        .env("KUBECONFIG", log_dir.path().join("missing-kubeconfig"))
        .env_remove("KUBE_CONFIG_PATH")
        .env_remove("KUBE_CONFIG_PATHS")
        .output()
        .await
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no pods found"), "stderr: {stderr}");
    assert_eq!(std::fs::read_dir(log_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_conflicting_ssh_credentials_are_rejected() {
    let output = Command::new(tunnelward_bin())
        .args([
            "ssh",
            "--ssh-host",
            "bastion.internal",
            "--ssh-password",
            "pw",
            "--ssh-key",
            "/nonexistent/id_ed25519",
            "--target-host",
            "db.internal",
            "--target-port",
            "5432",
        ])
        .env_remove("TUNNELWARD_SSH_KEY_PASSPHRASE")
        .output()
        .await
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("mutually exclusive"), "stderr: {stderr}");
}

#[tokio::test]
async fn test_version_names_the_binary() {
    let output = Command::new(tunnelward_bin())
        .arg("version")
        .output()
        .await
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("tunnelward "));
    assert!(stdout.contains(&format!("target: {}-", std::env::consts::ARCH)));
    assert!(!stdout.contains("rustc"));
}
