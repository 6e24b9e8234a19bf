//! Unit tests for runtime credential loading.
//!
//! These tests mutate process-global env vars and must run serially.

use appgen_relay::config::GlobalConfig;

fn make_config(notify_enabled: bool) -> GlobalConfig {
    let raw = format!(
        r#"
[agent]
endpoint = "http://agent"

[environment]
endpoint = "http://env"

[notify]
enabled = {notify_enabled}
"#
    );
    GlobalConfig::from_toml_str(&raw).expect("config parses")
}

#[tokio::test]
#[serial_test::serial]
async fn env_var_credentials_are_loaded() {
    std::env::set_var("APPGEN_AGENT_API_KEY", "agent-key");
    std::env::set_var("SKIPCALLS_API_KEY", "sms-key");

    let mut config = make_config(true);
    config.load_credentials().await.expect("credentials load");

    assert_eq!(config.agent.api_key, "agent-key");
    assert_eq!(config.notify.api_key, "sms-key");

    std::env::remove_var("APPGEN_AGENT_API_KEY");
    std::env::remove_var("SKIPCALLS_API_KEY");
}

#[tokio::test]
#[serial_test::serial]
async fn missing_sms_key_fails_only_when_notifications_enabled() {
    std::env::remove_var("SKIPCALLS_API_KEY");
    std::env::remove_var("APPGEN_AGENT_API_KEY");

    let mut disabled = make_config(false);
    disabled
        .load_credentials()
        .await
        .expect("no key needed while disabled");
    assert!(disabled.notify.api_key.is_empty());

    let mut enabled = make_config(true);
    let err = enabled.load_credentials().await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("SKIPCALLS_API_KEY"), "got: {msg}");
}

#[tokio::test]
#[serial_test::serial]
async fn empty_env_var_counts_as_missing() {
    std::env::set_var("SKIPCALLS_API_KEY", "");

    let mut config = make_config(true);
    assert!(config.load_credentials().await.is_err());

    std::env::remove_var("SKIPCALLS_API_KEY");
}

#[tokio::test]
#[serial_test::serial]
async fn agent_key_is_optional() {
    std::env::remove_var("APPGEN_AGENT_API_KEY");

    let mut config = make_config(false);
    config.load_credentials().await.expect("loads without agent key");
    assert!(config.agent.api_key.is_empty());
}
