use std::time::Duration;

use super::*;
use crate::TemplateId;

fn enabled_config() -> DedupConfig {
    DedupConfig {
        enabled: true,
        ..Default::default()
    }
}

#[test]
fn disabled_dedup_matches_nothing() {
    let matcher = DedupConfig::default().compile().unwrap();
    assert!(matcher.policy_for(&TemplateId::from("/etc/app.tmpl")).is_none());
}

#[test]
fn enabled_without_rules_matches_every_template() {
    let config = enabled_config();
    let matcher = config.compile().unwrap();

    let policy = matcher.policy_for(&TemplateId::from("/etc/app.tmpl")).unwrap();
    assert_eq!(policy, config.default_policy());
    assert_eq!(policy.lease_ttl, Duration::from_millis(15_000));
}

#[test]
fn first_matching_rule_wins() {
    let mut config = enabled_config();
    config.rules = vec![
        DedupRule {
            enabled: false,
            ..DedupRule::new(r"\.local\.tmpl$")
        },
        DedupRule {
            heartbeat_interval_ms: Some(1_000),
            ..DedupRule::new("^/etc/")
        },
    ];
    let matcher = config.compile().unwrap();

    assert!(matcher.policy_for(&TemplateId::from("/etc/x.local.tmpl")).is_none());

    let policy = matcher.policy_for(&TemplateId::from("/etc/nginx.tmpl")).unwrap();
    assert_eq!(policy.heartbeat_interval, Duration::from_millis(1_000));
    assert_eq!(policy.lease_ttl, config.default_policy().lease_ttl);
    // The inherited acquire retry interval is capped by the shorter heartbeat
    assert_eq!(policy.acquire_retry_interval, Duration::from_millis(1_000));

    // Not covered by any rule: private watch
    assert!(matcher.policy_for(&TemplateId::from("/srv/app.tmpl")).is_none());
}

#[test]
fn invalid_pattern_is_a_configuration_error() {
    let mut config = enabled_config();
    config.rules = vec![DedupRule::new("([unclosed")];

    let err = config.validate().unwrap_err();
    assert!(matches!(err, crate::Error::Config(_)));
    assert!(err.to_string().contains("dedup.rules[0].pattern"));
}

#[test]
fn heartbeat_must_be_shorter_than_lease() {
    let mut config = enabled_config();
    config.heartbeat_interval_ms = config.lease_ttl_ms;
    assert!(config.validate().is_err());

    let mut config = enabled_config();
    config.rules = vec![DedupRule {
        lease_ttl_ms: Some(500),
        ..DedupRule::new(".*")
    }];
    assert!(config.validate().is_err());
}

#[test]
fn empty_prefix_is_rejected() {
    let mut config = enabled_config();
    config.prefix = "//".into();
    assert!(config.validate().is_err());
}

#[test]
fn acquire_retry_must_not_exceed_heartbeat() {
    let mut config = enabled_config();
    config.lease_ttl_ms = 15_000;
    config.heartbeat_interval_ms = 5_000;
    config.acquire_retry_interval_ms = 600_000;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("acquire_retry_interval_ms"));

    config.acquire_retry_interval_ms = 5_000;
    assert!(config.validate().is_ok());

    let mut config = enabled_config();
    config.rules = vec![DedupRule {
        heartbeat_interval_ms: Some(1_000),
        acquire_retry_interval_ms: Some(2_000),
        ..DedupRule::new(".*")
    }];
    assert!(config.validate().is_err());
}
