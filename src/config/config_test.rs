use serial_test::serial;
use temp_env::with_vars;

use super::*;

fn cleanup_all_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("DTEMPLATE__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = TemplateNodeConfig::default();

    assert!(config.node.instance_id.is_none());
    assert_eq!(config.watch.max_wait_ms, 60_000);
    assert!(!config.watch.once);
    assert!(!config.dedup.enabled);
    assert_eq!(config.dedup.prefix, "d-template/dedup");
    assert_eq!(config.retry.fetch.max_retries, 0);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_env_vars();
    with_vars(
        vec![
            ("DTEMPLATE__DEDUP__ENABLED", Some("true")),
            ("DTEMPLATE__WATCH__MAX_WAIT_MS", Some("30000")),
            ("DTEMPLATE__NODE__INSTANCE_ID", Some("node-a")),
        ],
        || {
            let config = TemplateNodeConfig::new().unwrap().validate().unwrap();

            assert!(config.dedup.enabled);
            assert_eq!(config.watch.max_wait_ms, 30_000);
            assert_eq!(config.node.resolve_instance_id(), "node-a");
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("dynamic_config.toml");

    std::fs::write(
        &config_path,
        r#"
        [dedup]
        enabled = true
        prefix = "service/templates"
        lease_ttl_ms = 6000
        heartbeat_interval_ms = 2000
        acquire_retry_interval_ms = 1000

        [[dedup.rules]]
        pattern = "^/etc/nginx/"

        [[dedup.rules]]
        pattern = "local"
        enabled = false
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = TemplateNodeConfig::new().expect("success");
        let config = base_config
            .with_override_config(config_path.to_str().unwrap())
            .unwrap()
            .validate()
            .unwrap();

        assert!(config.dedup.enabled);
        assert_eq!(config.dedup.prefix, "service/templates");
        assert_eq!(config.dedup.lease_ttl_ms, 6000);
        assert_eq!(config.dedup.rules.len(), 2);
        assert!(!config.dedup.rules[1].enabled);
    });
}

#[test]
#[serial]
fn environment_variables_should_have_highest_priority() {
    cleanup_all_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("test_config.toml");
    std::fs::write(
        &config_path,
        r#"
        [watch]
        max_wait_ms = 10000
        min_fetch_interval_ms = 50
        "#,
    )
    .unwrap();

    with_vars(
        vec![
            ("CONFIG_PATH", Some(config_path.to_str().unwrap())),
            ("DTEMPLATE__WATCH__MAX_WAIT_MS", Some("20000")),
        ],
        || {
            let config = TemplateNodeConfig::new().unwrap();

            assert_eq!(config.watch.max_wait_ms, 20_000);
            assert_eq!(config.watch.min_fetch_interval_ms, 50);
        },
    );
}

#[test]
#[serial]
fn missing_config_file_is_an_error() {
    cleanup_all_env_vars();
    with_vars(vec![("CONFIG_PATH", Some("/nonexistent/d-template.toml"))], || {
        assert!(TemplateNodeConfig::new().is_err());
    });
}

#[test]
fn fetch_timeout_must_exceed_blocking_wait() {
    let mut config = TemplateNodeConfig::default();
    config.retry.fetch.timeout_ms = config.watch.max_wait_ms;

    assert!(config.validate().is_err());
}

#[test]
fn blank_instance_id_is_rejected() {
    let mut config = TemplateNodeConfig::default();
    config.node.instance_id = Some("  ".into());

    assert!(config.validate().is_err());
}

#[test]
fn generated_instance_ids_are_unique() {
    let node = NodeConfig::default();
    assert_ne!(node.resolve_instance_id(), node.resolve_instance_id());
}
