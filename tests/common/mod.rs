use std::time::Duration;

use d_template::BackoffPolicy;
use d_template::TemplateNodeConfig;
use tokio::time::sleep;
use tokio::time::Instant;

pub const LEASE_TTL_MS: u64 = 300;
pub const HEARTBEAT_MS: u64 = 100;
pub const ACQUIRE_RETRY_MS: u64 = 100;

/// Polls `condition` until it holds or `within` elapses.
pub async fn wait_until(
    within: Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Validated configuration with short timings for paused-clock tests.
pub fn node_config(
    instance_id: &str,
    dedup: bool,
) -> TemplateNodeConfig {
    let mut config = TemplateNodeConfig::default();
    config.node.instance_id = Some(instance_id.to_string());
    config.watch.max_wait_ms = 1_000;
    config.watch.min_fetch_interval_ms = 10;
    config.retry.fetch = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 5_000,
        base_delay_ms: 10,
        max_delay_ms: 100,
    };
    config.retry.publish = BackoffPolicy {
        max_retries: 2,
        timeout_ms: 200,
        base_delay_ms: 10,
        max_delay_ms: 50,
    };
    config.dedup.enabled = dedup;
    config.dedup.prefix = "it/dedup".into();
    config.dedup.lease_ttl_ms = LEASE_TTL_MS;
    config.dedup.heartbeat_interval_ms = HEARTBEAT_MS;
    config.dedup.acquire_retry_interval_ms = ACQUIRE_RETRY_MS;
    config.dedup.max_wait_ms = 1_000;
    config.validate().expect("test config is valid")
}
