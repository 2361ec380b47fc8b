//! Test utilities for multi-node mesh tests

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fieldlink_mesh::MeshConfig;

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Config for a loopback test node. Intervals are shrunk so discovery
/// and retry behavior is observable within a test timeout; the annotation
/// port is scoped per test block since it is shared within one.
pub fn loopback_config(nickname: &str, base_port: u16, annotation_port: u16) -> MeshConfig {
    MeshConfig {
        nickname: nickname.to_string(),
        base_port,
        annotation_port,
        bind_addr: Some("127.0.0.1".parse().unwrap()),
        discovery_interval_min_ms: 200,
        discovery_interval_default_ms: 400,
        discovery_interval_max_ms: 1_000,
        peer_timeout_min_ms: 1_000,
        peer_timeout_max_ms: 3_000,
        ping_interval_ms: 500,
        max_retries: 2,
        retry_delay_ms: 100,
        cache_path: ":memory:".to_string(),
        ..MeshConfig::default()
    }
}

/// Wire two loopback nodes together through their seed-peer lists, since
/// 255.255.255.255 broadcasts are not deliverable between two sockets on
/// the same host in every environment.
pub fn seed_each_other(a: &mut MeshConfig, b: &mut MeshConfig) {
    a.seed_peers = vec![format!("127.0.0.1:{}", b.base_port).parse().unwrap()];
    b.seed_peers = vec![format!("127.0.0.1:{}", a.base_port).parse().unwrap()];
}

/// Poll a condition until it holds or the timeout elapses. Returns
/// whether the condition was observed.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
