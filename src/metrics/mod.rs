//! Prometheus collectors for the watch and dedup core.
//!
//! Collectors are process globals registered into [`REGISTRY`] on first use
//! of [`gather`]. Exposing them over HTTP is left to the embedding process.


use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::warn;

lazy_static! {
    pub static ref ACTIVE_VIEWS: IntGauge =
        IntGauge::new("active_views", "Number of running dependency views")
            .expect("metric can not be created");

    pub static ref FETCH_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("fetch_errors", "Failed dependency fetches by dependency type"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref BRAIN_UPDATES: IntCounter =
        IntCounter::new("brain_updates", "Dependency value changes stored in the brain")
            .expect("metric can not be created");

    /// 1 while leading, 0 while following
    pub static ref DEDUP_ROLE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("dedup_role", "Dedup role per template"),
        &["template"]
    )
    .expect("metric can not be created");

    pub static ref LEADERSHIP_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("leadership_transitions", "Leading/following transitions per template"),
        &["template"]
    )
    .expect("metric can not be created");

    pub static ref SHARED_DATA_PUBLISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("shared_data_published", "Snapshots published as leader"),
        &["template"]
    )
    .expect("metric can not be created");

    pub static ref SHARED_DATA_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("shared_data_rejected", "Snapshots ignored as malformed or stale"),
        &["template"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_VIEWS.clone()),
        Box::new(FETCH_ERRORS.clone()),
        Box::new(BRAIN_UPDATES.clone()),
        Box::new(DEDUP_ROLE.clone()),
        Box::new(LEADERSHIP_TRANSITIONS.clone()),
        Box::new(SHARED_DATA_PUBLISHED.clone()),
        Box::new(SHARED_DATA_REJECTED.clone()),
    ];
    for c in collectors {
        if let Err(e) = registry.register(c) {
            warn!("collector can not be registered: {:?}", e);
        }
    }
}

/// Text exposition of every collector in [`REGISTRY`].
pub fn gather() -> String {
    REGISTER.call_once(|| register_custom_metrics(&REGISTRY));

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode metrics: {:?}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
