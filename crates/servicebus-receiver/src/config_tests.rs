//! Tests for receiver configuration.

use super::*;
use std::io::Write;

fn valid_config() -> ReceiverConfig {
    ReceiverConfig {
        entity_path: "orders".to_string(),
        ..Default::default()
    }
}

#[test]
fn test_defaults() {
    let config = ReceiverConfig::default();

    assert_eq!(config.prefetch_count, 0);
    assert!(config.auto_complete);
    assert!(!config.disable_session_timeout_retry);
    assert_eq!(config.max_auto_lock_renew_duration(), Duration::from_secs(300));
    assert_eq!(config.try_timeout(), Duration::from_secs(60));
    assert_eq!(config.max_wait_between_messages(), Duration::from_secs(1));
    assert_eq!(config.max_concurrent_sessions, 1);
}

#[test]
fn test_validate_requires_entity_path() {
    let config = ReceiverConfig::default();

    assert!(matches!(
        config.validate(),
        Err(ConfigurationError::Missing { key }) if key == "entity_path"
    ));
    assert!(valid_config().validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_values() {
    let config = ReceiverConfig {
        try_timeout_millis: 0,
        ..valid_config()
    };
    assert!(matches!(config.validate(), Err(ConfigurationError::Invalid { .. })));

    let config = ReceiverConfig {
        max_concurrent_sessions: 0,
        ..valid_config()
    };
    assert!(matches!(config.validate(), Err(ConfigurationError::Invalid { .. })));

    let config = ReceiverConfig {
        session_idle_timeout_millis: 0,
        ..valid_config()
    };
    assert!(matches!(config.validate(), Err(ConfigurationError::Invalid { .. })));
}

#[test]
fn test_load_from_yaml_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    writeln!(
        file,
        "entity_path: invoices\nprefetch_count: 25\nauto_complete: false\nmax_auto_lock_renew_millis: 120000"
    )
    .expect("write config");

    let config = ReceiverConfig::load(Some(file.path())).expect("config should load");

    assert_eq!(config.entity_path, "invoices");
    assert_eq!(config.prefetch_count, 25);
    assert!(!config.auto_complete);
    assert_eq!(config.max_auto_lock_renew_duration(), Duration::from_secs(120));
    // Unspecified fields fall back to defaults
    assert_eq!(config.try_timeout_millis, 60_000);
}

#[test]
fn test_load_from_missing_explicit_file_fails() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("absent.yaml");

    assert!(ReceiverConfig::load(Some(&missing)).is_err());
}

#[test]
fn test_load_rejects_invalid_file_contents() {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    writeln!(file, "entity_path: invoices\nmax_concurrent_sessions: 0").expect("write config");

    assert!(matches!(
        ReceiverConfig::load(Some(file.path())),
        Err(ConfigurationError::Invalid { .. })
    ));
}
