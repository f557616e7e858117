//! Helpers shared by the unit tests of every module.

use std::time::Duration;

use tokio::time::sleep;
use tokio::time::Instant;

use crate::BackoffPolicy;
use crate::DedupPolicy;
use crate::TemplateNodeConfig;
use crate::ViewSettings;

/// Polls `condition` every few milliseconds until it holds or `within`
/// elapses. Works with paused tokio time.
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

pub fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 5_000,
        base_delay_ms: 10,
        max_delay_ms: 100,
    }
}

pub fn fast_view_settings() -> ViewSettings {
    ViewSettings {
        max_wait: Duration::from_millis(1_000),
        min_fetch_interval: Duration::from_millis(10),
        once: false,
        retry: fast_retry(),
    }
}

pub fn fast_dedup_policy() -> DedupPolicy {
    DedupPolicy {
        lease_ttl: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(100),
        acquire_retry_interval: Duration::from_millis(100),
        max_wait: Duration::from_millis(1_000),
    }
}

/// Bounded policy for shared data writes and lease release.
pub fn fast_publish_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        timeout_ms: 200,
        base_delay_ms: 10,
        max_delay_ms: 50,
    }
}

/// Configuration with every interval shortened to match the helpers above.
pub fn fast_config() -> TemplateNodeConfig {
    let mut config = TemplateNodeConfig::default();
    config.watch.max_wait_ms = 1_000;
    config.watch.min_fetch_interval_ms = 10;
    config.retry.fetch = fast_retry();
    config.retry.publish = fast_publish_policy();
    config.dedup.lease_ttl_ms = 300;
    config.dedup.heartbeat_interval_ms = 100;
    config.dedup.acquire_retry_interval_ms = 100;
    config.dedup.max_wait_ms = 1_000;
    config
}
