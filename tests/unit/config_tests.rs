//! Unit tests for configuration parsing and validation.

use std::time::Duration;

use appgen_relay::config::GlobalConfig;
use appgen_relay::AppError;

const MINIMAL: &str = r#"
[agent]
endpoint = "http://agent.internal:8080"

[environment]
endpoint = "http://sandbox.internal:9090"
"#;

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str(MINIMAL).expect("config parses");
    assert_eq!(config.http_port, 3000);
    assert_eq!(config.coordinator.stop_timeout(), Duration::from_secs(5));
    assert_eq!(config.coordinator.poll_interval(), Duration::from_millis(250));
    assert_eq!(config.coordinator.busy_retry_after_seconds, 2);
    assert_eq!(config.store.max_attempts, 4);
    assert_eq!(config.stream.grace_period_seconds, 3600);
    assert!(!config.notify.enabled);
    assert!(config.notify.preview_domain.is_none());
    assert!(config.node_id.is_none());
}

#[test]
fn explicit_sections_override_defaults() {
    let raw = r#"
http_port = 8081
db_path = "/var/lib/relay/relay.db"
node_id = "node-a"

[coordinator]
stop_timeout_ms = 2000
poll_interval_ms = 100

[store]
max_attempts = 2

[stream]
poll_interval_ms = 50
grace_period_seconds = 60

[agent]
endpoint = "http://agent"

[environment]
endpoint = "http://env"

[notify]
enabled = true
preview_domain = "preview.example.com"
max_attempts = 5
"#;
    let config = GlobalConfig::from_toml_str(raw).expect("config parses");
    assert_eq!(config.http_port, 8081);
    assert_eq!(config.node_id.as_deref(), Some("node-a"));
    assert_eq!(config.coordinator.stop_timeout_ms, 2000);
    assert_eq!(config.store.max_attempts, 2);
    assert_eq!(config.stream.poll_interval_ms, 50);
    assert!(config.notify.enabled);
    assert_eq!(config.notify.max_attempts, 5);
    assert_eq!(
        config.notify.preview_domain.as_deref(),
        Some("preview.example.com")
    );
}

#[test]
fn missing_agent_section_is_rejected() {
    let raw = r#"
[environment]
endpoint = "http://env"
"#;
    assert!(matches!(
        GlobalConfig::from_toml_str(raw),
        Err(AppError::Config(_))
    ));
}

#[test]
fn empty_endpoint_is_rejected() {
    let raw = r#"
[agent]
endpoint = "  "

[environment]
endpoint = "http://env"
"#;
    let err = GlobalConfig::from_toml_str(raw).unwrap_err();
    assert!(err.to_string().contains("agent.endpoint"));
}

#[test]
fn poll_interval_must_be_sub_second() {
    let raw = format!("{MINIMAL}\n[coordinator]\npoll_interval_ms = 1500\n");
    let err = GlobalConfig::from_toml_str(&raw).unwrap_err();
    assert!(err.to_string().contains("sub-second"));
}

#[test]
fn stop_timeout_shorter_than_poll_is_rejected() {
    let raw = format!("{MINIMAL}\n[coordinator]\nstop_timeout_ms = 10\npoll_interval_ms = 200\n");
    assert!(GlobalConfig::from_toml_str(&raw).is_err());
}

#[test]
fn zero_store_attempts_is_rejected() {
    let raw = format!("{MINIMAL}\n[store]\nmax_attempts = 0\n");
    assert!(GlobalConfig::from_toml_str(&raw).is_err());
}

#[test]
fn oversized_grace_period_is_rejected() {
    let raw = format!("{MINIMAL}\n[stream]\ngrace_period_seconds = {}\n", u64::MAX / 2);
    let err = GlobalConfig::from_toml_str(&raw).unwrap_err();
    assert!(err.to_string().contains("grace_period_seconds"));
}

#[test]
fn one_year_grace_period_is_accepted() {
    let raw = format!("{MINIMAL}\n[stream]\ngrace_period_seconds = 31536000\n");
    let config = GlobalConfig::from_toml_str(&raw).expect("valid config");
    assert_eq!(config.stream.grace_period_seconds, 31_536_000);
}

#[test]
fn secrets_are_never_read_from_toml() {
    let raw = r#"
[agent]
endpoint = "http://agent"
api_key = "should-not-load"

[environment]
endpoint = "http://env"
"#;
    // Unknown-but-skipped fields must not populate runtime secrets.
    if let Ok(config) = GlobalConfig::from_toml_str(raw) {
        assert!(config.agent.api_key.is_empty());
    }
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, MINIMAL).expect("write config");
    let config = GlobalConfig::load_from_path(&path).expect("loads");
    assert_eq!(config.agent.endpoint, "http://agent.internal:8080");
}

#[test]
fn load_from_missing_path_is_config_error() {
    let err = GlobalConfig::load_from_path("/nonexistent/appgen-relay.toml").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}
