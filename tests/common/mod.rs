//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use configmap_reloader::config::{LifecycleConfig, Settings};
use configmap_reloader::lifecycle::{ControllerStatus, LifecycleState};
use tokio::sync::watch;

/// Settings with the restart cycle shrunk to tens of milliseconds.
pub fn fast_settings(config_path: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.config_path = config_path.to_path_buf();
    settings.listener.bind_address = "127.0.0.1:0".into();
    settings.lifecycle = LifecycleConfig {
        tick_ms: 20,
        shutdown_grace_ms: 500,
        restart_cooldown_ms: 100,
        probe_settle_ms: 20,
        probe_timeout_ms: 2000,
    };
    settings
}

/// Client that never reuses connections, so every request sees the live server.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

/// Wait until the controller publishes a running server.
pub async fn wait_running(status: &mut watch::Receiver<ControllerStatus>) -> SocketAddr {
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == LifecycleState::Running),
    )
    .await
    .expect("controller never started a server")
    .unwrap();
    status.address.unwrap()
}

/// Poll `GET /` until it returns `expected` or `timeout` passes.
///
/// Connection failures are expected while a restart is in progress.
pub async fn wait_for_body(
    client: &reqwest::Client,
    addr: SocketAddr,
    expected: &str,
    timeout: Duration,
) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = String::from("<no response>");

    while tokio::time::Instant::now() < deadline {
        if let Ok(res) = client.get(format!("http://{}/", addr)).send().await {
            assert_eq!(res.status(), 200);
            last = res.text().await.unwrap_or_default();
            if last == expected {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Err(format!("expected body {:?}, last saw {:?}", expected, last))
}
