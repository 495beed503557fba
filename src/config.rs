use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gate::GateSettings;

/// Prefix of every environment override, e.g. `WINDOW_COUNTER_WINDOW_SECS`.
pub const ENV_PREFIX: &str = "WINDOW_COUNTER_";

/// Settings of a [`SlidingCounter`](crate::SlidingCounter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterConfig {
    /// Trailing duration over which events are counted.
    pub window: Duration,
    /// Minimum event-time gap between two automatic snapshots.
    pub persist_interval: Duration,
    /// Maximum number of requests processed at once.
    pub concurrency: usize,
    /// Accepted requests waiting for a worker; submitters block beyond this.
    pub queue_capacity: usize,
    /// Artificial per-request work time. Zero disables it.
    pub processing_delay: Duration,
    /// How long `close` waits for accepted requests before dropping them.
    pub drain_timeout: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            persist_interval: Duration::from_millis(300),
            concurrency: 5,
            queue_capacity: 100,
            processing_delay: Duration::ZERO,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl CounterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gate_settings().map(|_| ())
    }

    pub(crate) fn gate_settings(&self) -> Result<GateSettings, ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::Invalid("window must be greater than zero".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        let window = TimeDelta::from_std(self.window)
            .map_err(|_| ConfigError::Invalid(format!("window too large: {:?}", self.window)))?;
        let persist_interval = TimeDelta::from_std(self.persist_interval).map_err(|_| {
            ConfigError::Invalid(format!(
                "persist_interval too large: {:?}",
                self.persist_interval
            ))
        })?;

        Ok(GateSettings {
            window,
            persist_interval,
            concurrency: self.concurrency,
            queue_capacity: self.queue_capacity,
            processing_delay: self.processing_delay,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid(format!(
                "unknown log format '{other}' (expected pretty or json)"
            ))),
        }
    }
}

/// Process configuration, as read from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub counter: CounterSection,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Per-request deadline imposed by the HTTP handler.
    pub request_timeout_ms: u64,
    /// Bound on waiting for open HTTP connections at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 5_000,
            shutdown_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CounterSection {
    pub window_secs: u64,
    pub persist_interval_ms: u64,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub processing_delay_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for CounterSection {
    fn default() -> Self {
        Self {
            window_secs: 60,
            persist_interval_ms: 300,
            concurrency: 5,
            queue_capacity: 100,
            processing_delay_ms: 0,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("data.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AppConfig {
    pub fn counter_config(&self) -> CounterConfig {
        let c = &self.counter;
        CounterConfig {
            window: Duration::from_secs(c.window_secs),
            persist_interval: Duration::from_millis(c.persist_interval_ms),
            concurrency: c.concurrency,
            queue_capacity: c.queue_capacity,
            processing_delay: Duration::from_millis(c.processing_delay_ms),
            drain_timeout: Duration::from_millis(c.drain_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.counter_config().validate()?;
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("server.listen must not be empty".into()));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.request_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.storage.data_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.data_file must not be empty".into()));
        }
        Ok(())
    }
}

/// Load `path` (defaults when it does not exist), apply `WINDOW_COUNTER_*` overrides
/// from the process environment, then validate.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`], reading overrides through `env_lookup`.
pub fn load_config_with<F>(path: &Path, env_lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content)?
    } else {
        tracing::debug!(path = %path.display(), "Config file not found, using defaults");
        AppConfig::default()
    };
    apply_env_overrides(&mut config, env_lookup)?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from a TOML string and validate it.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut AppConfig, env_lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| env_lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("LISTEN") {
        config.server.listen = v;
    }
    if let Some(v) = var("REQUEST_TIMEOUT_MS") {
        config.server.request_timeout_ms = parse_env("REQUEST_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("SHUTDOWN_TIMEOUT_SECS") {
        config.server.shutdown_timeout_secs = parse_env("SHUTDOWN_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = var("WINDOW_SECS") {
        config.counter.window_secs = parse_env("WINDOW_SECS", &v)?;
    }
    if let Some(v) = var("PERSIST_INTERVAL_MS") {
        config.counter.persist_interval_ms = parse_env("PERSIST_INTERVAL_MS", &v)?;
    }
    if let Some(v) = var("CONCURRENCY") {
        config.counter.concurrency = parse_env("CONCURRENCY", &v)?;
    }
    if let Some(v) = var("QUEUE_CAPACITY") {
        config.counter.queue_capacity = parse_env("QUEUE_CAPACITY", &v)?;
    }
    if let Some(v) = var("PROCESSING_DELAY_MS") {
        config.counter.processing_delay_ms = parse_env("PROCESSING_DELAY_MS", &v)?;
    }
    if let Some(v) = var("DRAIN_TIMEOUT_MS") {
        config.counter.drain_timeout_ms = parse_env("DRAIN_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("DATA_FILE") {
        config.storage.data_file = PathBuf::from(v);
    }
    if let Some(v) = var("LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = var("LOG_FORMAT") {
        config.logging.format = v.parse()?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!("{ENV_PREFIX}{name}: cannot parse '{value}'"))
    })
}
