//! Configuration management for Hivegate.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional YAML file, then `HIVEGATE__*` environment variables
//! (e.g. `HIVEGATE__STORE__URL`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{HivegateError, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HIVEGATE";

/// Main configuration for a Hivegate deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HivegateConfig {
    /// Shared counter store
    #[serde(default)]
    pub store: StoreConfig,

    /// Local fallback limiter
    #[serde(default)]
    pub local: LocalConfig,

    /// Rate limit policies
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Usage events
    #[serde(default)]
    pub events: EventsConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one every decision is made locally
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Hard bound on one store round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between recovery probes while degraded, in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

fn default_key_prefix() -> String {
    "hivegate".to_string()
}

fn default_timeout_ms() -> u64 {
    25
}

fn default_probe_interval_ms() -> u64 {
    5000
}

/// Local fallback limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Upper bound on tracked subjects
    #[serde(default = "default_max_subjects")]
    pub max_subjects: usize,

    /// Expired-subject sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_subjects: default_max_subjects(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max_subjects() -> usize {
    100_000
}

fn default_sweep_interval() -> u64 {
    30
}

/// Policy source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Path to the YAML policy file; built-in tier defaults apply without one
    #[serde(default)]
    pub path: Option<String>,

    /// Policy file reload interval in seconds; 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

/// Usage event configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_events_enabled")]
    pub enabled: bool,

    /// Events buffered before new ones are dropped
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: default_events_enabled(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_events_enabled() -> bool {
    true
}

fn default_buffer_size() -> usize {
    1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl HivegateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: HivegateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, ignoring the environment.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: HivegateConfig = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(HivegateError::Config(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.probe_interval_ms == 0 {
            return Err(HivegateError::Config(
                "store.probe_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.local.max_subjects == 0 {
            return Err(HivegateError::Config(
                "local.max_subjects must be greater than 0".to_string(),
            ));
        }
        if self.local.sweep_interval_secs == 0 {
            return Err(HivegateError::Config(
                "local.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.events.buffer_size == 0 {
            return Err(HivegateError::Config(
                "events.buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = HivegateConfig::default();
        assert_eq!(config.store.url, None);
        assert_eq!(config.store.key_prefix, "hivegate");
        assert_eq!(config.store.timeout(), Duration::from_millis(25));
        assert_eq!(config.store.probe_interval(), Duration::from_secs(5));
        assert_eq!(config.local.max_subjects, 100_000);
        assert_eq!(config.policy.reload_interval_secs, 60);
        assert!(config.events.enabled);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_partial_file() {
        let file = yaml_file(
            r#"
store:
  url: redis://cache:6379
  timeout_ms: 50
logging:
  format: json
"#,
        );

        let config = HivegateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store.timeout_ms, 50);
        assert_eq!(config.store.probe_interval_ms, 5000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.local, LocalConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = yaml_file("store:\n  timeout_ms: 0\n");
        assert!(matches!(
            HivegateConfig::from_file(file.path()),
            Err(HivegateError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            HivegateConfig::from_file("/nonexistent/hivegate.yaml"),
            Err(HivegateError::ConfigSource(_))
        ));
    }
}
