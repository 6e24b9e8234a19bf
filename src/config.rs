//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name used for runtime secrets.
pub const KEYRING_SERVICE: &str = "appgen-relay";

/// Admission and preemption tuning for the session coordinator.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CoordinatorConfig {
    /// How long a start request waits for a preempted session to stop.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Polling interval used while awaiting termination.
    #[serde(default = "default_coordinator_poll_ms")]
    pub poll_interval_ms: u64,
    /// Value of the `Retry-After` header on busy responses.
    #[serde(default = "default_busy_retry_after")]
    pub busy_retry_after_seconds: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            poll_interval_ms: default_coordinator_poll_ms(),
            busy_retry_after_seconds: default_busy_retry_after(),
        }
    }
}

impl CoordinatorConfig {
    /// Stop timeout as a [`Duration`].
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Bounded retry policy for session store calls.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StoreConfig {
    /// Total attempts per store call, including the first.
    #[serde(default = "default_store_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_store_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Stream transport tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Interval at which subscribers re-poll the store for new events.
    #[serde(default = "default_stream_poll_ms")]
    pub poll_interval_ms: u64,
    /// Seconds a closed buffer stays readable before collection.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    /// Seconds between garbage-collection passes.
    #[serde(default = "default_gc_interval")]
    pub gc_interval_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_stream_poll_ms(),
            grace_period_seconds: default_grace_period(),
            gc_interval_seconds: default_gc_interval(),
        }
    }
}

/// Agent runtime endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Base URL of the agent runtime service.
    pub endpoint: String,
    /// API key (populated at runtime).
    #[serde(skip)]
    pub api_key: String,
}

/// Execution environment provider endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EnvironmentConfig {
    /// Base URL of the environment provider.
    pub endpoint: String,
}

/// Completion notification settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NotifyConfig {
    /// Whether completion notifications are sent at all.
    #[serde(default)]
    pub enabled: bool,
    /// SMS gateway URL.
    #[serde(default = "default_sms_url")]
    pub api_url: String,
    /// Fallback domain for preview links when the environment has none.
    #[serde(default)]
    pub preview_domain: Option<String>,
    /// Delivery attempts before a notification is dropped.
    #[serde(default = "default_notify_attempts")]
    pub max_attempts: u32,
    /// SMS gateway API key (populated at runtime).
    #[serde(skip)]
    pub api_key: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_sms_url(),
            preview_domain: None,
            max_attempts: default_notify_attempts(),
            api_key: String::new(),
        }
    }
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_coordinator_poll_ms() -> u64 {
    250
}

fn default_busy_retry_after() -> u64 {
    2
}

fn default_store_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1_000
}

fn default_stream_poll_ms() -> u64 {
    500
}

/// Upper bound for the buffer grace period (one year).
pub const MAX_GRACE_PERIOD_SECONDS: u64 = 365 * 24 * 3_600;

fn default_grace_period() -> u64 {
    3_600
}

fn default_gc_interval() -> u64 {
    300
}

fn default_sms_url() -> String {
    "https://be.skipcalls.com/sms/send".into()
}

fn default_notify_attempts() -> u32 {
    3
}

fn default_http_port() -> u16 {
    3000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/appgen-relay.db")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// HTTP port for the public API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Path of the shared `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Identifier of this node in logs; random when omitted.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Admission and preemption tuning.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Store retry policy.
    #[serde(default)]
    pub store: StoreConfig,
    /// Stream transport tuning.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Agent runtime connectivity.
    pub agent: AgentConfig,
    /// Execution environment connectivity.
    pub environment: EnvironmentConfig,
    /// Completion notifications.
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load runtime secrets from the OS keychain with env-var fallback.
    ///
    /// The agent key is optional; the SMS key is required only when
    /// notifications are enabled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if notifications are enabled and no SMS
    /// API key can be found.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.agent.api_key = load_credential("agent_api_key", "APPGEN_AGENT_API_KEY")
            .await
            .unwrap_or_default();
        if self.notify.enabled {
            self.notify.api_key = load_credential("sms_api_key", "SKIPCALLS_API_KEY").await?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.coordinator.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "coordinator.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.coordinator.poll_interval_ms >= 1_000 {
            return Err(AppError::Config(
                "coordinator.poll_interval_ms must be sub-second".into(),
            ));
        }
        if self.coordinator.stop_timeout_ms < self.coordinator.poll_interval_ms {
            return Err(AppError::Config(
                "coordinator.stop_timeout_ms must be at least one poll interval".into(),
            ));
        }
        if self.store.max_attempts == 0 {
            return Err(AppError::Config(
                "store.max_attempts must be greater than zero".into(),
            ));
        }
        if self.stream.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "stream.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.stream.grace_period_seconds > MAX_GRACE_PERIOD_SECONDS {
            return Err(AppError::Config(format!(
                "stream.grace_period_seconds must not exceed {MAX_GRACE_PERIOD_SECONDS}"
            )));
        }
        if self.agent.endpoint.trim().is_empty() {
            return Err(AppError::Config("agent.endpoint must not be empty".into()));
        }
        if self.environment.endpoint.trim().is_empty() {
            return Err(AppError::Config(
                "environment.endpoint must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::Config(format!(
                "credential {keyring_key} not found in keychain or {env_key} env var"
            ))
        })
}
