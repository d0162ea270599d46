use memex_sync::{MemexConfig, SyncError, MAX_RETRIES};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[test]
fn default_config() {
    let config = MemexConfig::default();
    assert_eq!(config.cross_space_interval(), Duration::from_secs(30));
    assert_eq!(config.queue_retry_interval(), Duration::from_secs(60));
    assert_eq!(config.request_timeout(), Duration::from_secs(30));
    assert_eq!(config.max_retries, MAX_RETRIES);
    assert_eq!(config.max_backoff_multiplier, 16);
    assert!(!config.anonymize_authors);
}

#[test]
fn partial_json_keeps_defaults() {
    let config =
        MemexConfig::from_json_str(r#"{"anonymize_authors": true, "max_retries": 5}"#).unwrap();
    assert!(config.anonymize_authors);
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.cross_space_interval_secs, 30);
}

#[test]
fn zero_intervals_are_clamped() {
    let config = MemexConfig {
        cross_space_interval_secs: 0,
        queue_retry_interval_secs: 0,
        ..Default::default()
    };
    assert_eq!(config.cross_space_interval(), Duration::from_secs(1));
    assert_eq!(config.queue_retry_interval(), Duration::from_secs(1));
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memex.json");
    std::fs::write(&path, r#"{"request_timeout_ms": 500}"#).unwrap();

    let config = MemexConfig::load(&path).unwrap();
    assert_eq!(config.request_timeout(), Duration::from_millis(500));
}

#[test]
fn load_errors() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        MemexConfig::load(dir.path().join("missing.json")),
        Err(SyncError::PersistenceFailure(_))
    ));

    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{not json").unwrap();
    assert!(matches!(
        MemexConfig::load(&path),
        Err(SyncError::Serialization(_))
    ));
}
