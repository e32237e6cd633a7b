//! Configuration management for the LineWire client.
//!
//! The client reads one TOML file (see [`config_path`]), lets a few
//! `LINEWIRE_*` environment variables override it, and refuses to start on
//! values that fail [`Config::validate`]. Every section may be omitted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown device type: {0}")]
    UnknownDevice(String),

    #[error("scheme must be http or https, got {0}")]
    InvalidScheme(String),

    #[error("endpoint must not be empty")]
    EmptyEndpoint,

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),

    #[error("long_timeout_ms ({long}) must not be shorter than timeout_ms ({default})")]
    LongTimeoutTooShort { long: u64, default: u64 },

    #[error("base_backoff_ms ({base}) must not exceed max_backoff_ms ({max})")]
    BackoffOrder { base: u64, max: u64 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("invalid TOML: {0}")]
    Parse(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the LineWire client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Device identity and local storage.
    pub client: ClientConfig,

    /// HTTP transport settings.
    pub transport: TransportConfig,

    /// Long-poll listener and watchdog settings.
    pub listener: ListenerConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Device identity and local storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Device type the client presents itself as (e.g. DESKTOPWIN).
    pub device: String,

    /// Overrides the device's default application version.
    pub app_version: Option<String>,

    /// Path of the JSON credential store.
    pub storage_path: PathBuf,
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Service host name.
    pub endpoint: String,

    /// URL scheme (http or https).
    pub scheme: String,

    /// Default per-call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Timeout for long-poll calls in milliseconds.
    pub long_timeout_ms: u64,
}

/// Long-poll listener and watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Run the talk (sync) listener.
    pub talk: bool,

    /// Run the square (fetchMyEvents) listener.
    pub square: bool,

    /// Operation limit per sync call.
    pub sync_limit: i32,

    /// Event limit per fetchMyEvents call.
    pub fetch_limit: i32,

    /// Consecutive non-transient failures before a listener stops.
    pub max_consecutive_errors: u32,

    /// First transient backoff delay in milliseconds.
    pub base_backoff_ms: u64,

    /// Upper bound for transient backoff in milliseconds.
    pub max_backoff_ms: u64,

    /// Fixed delay after a non-transient failure in milliseconds.
    pub api_error_delay_ms: u64,

    /// Interval between watchdog checks in milliseconds.
    pub watchdog_interval_ms: u64,

    /// Restarts allowed per listener.
    pub max_restarts: u32,

    /// Capacity of the event channel.
    pub event_channel_capacity: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Write daily-rotated log files here instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device: "DESKTOPWIN".to_string(),
            app_version: None,
            storage_path: default_data_dir().join("storage.json"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "legy.line-apps.com".to_string(),
            scheme: "https".to_string(),
            timeout_ms: 30_000,
            long_timeout_ms: 180_000,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            talk: true,
            square: true,
            sync_limit: 100,
            fetch_limit: 100,
            max_consecutive_errors: 10,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            api_error_delay_ms: 2_000,
            watchdog_interval_ms: 5_000,
            max_restarts: 10,
            event_channel_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }
}

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "LINEWIRE_CONFIG";

/// Path of the configuration file: `$LINEWIRE_CONFIG` when set, otherwise
/// `config.toml` under the platform config directory.
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("linewire")
            .join("config.toml"),
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("linewire")
}

/// Environment overrides as `(variable, setter)`.
const ENV_OVERRIDES: &[(&str, fn(&mut Config, String))] = &[
    ("LINEWIRE_ENDPOINT", |c: &mut Config, v| c.transport.endpoint = v),
    ("LINEWIRE_DEVICE", |c: &mut Config, v| c.client.device = v),
    ("LINEWIRE_STORAGE", |c: &mut Config, v| c.client.storage_path = PathBuf::from(v)),
    ("LINEWIRE_LOG_LEVEL", |c: &mut Config, v| c.logging.level = v),
];

impl Config {
    /// Applies `LINEWIRE_ENDPOINT`, `LINEWIRE_DEVICE`, `LINEWIRE_STORAGE`
    /// and `LINEWIRE_LOG_LEVEL`. Empty variables are ignored.
    pub fn apply_env_overrides(&mut self) {
        for (name, set) in ENV_OVERRIDES {
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => {
                    tracing::info!("{} overrides configuration: {}", name, value);
                    set(self, value);
                }
                _ => {}
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.device.parse::<Device>().is_err() {
            return Err(ConfigError::UnknownDevice(self.client.device.clone()));
        }

        let scheme = &self.transport.scheme;
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::InvalidScheme(scheme.clone()));
        }
        if self.transport.endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }

        if self.transport.timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("timeout_ms"));
        }
        if self.transport.long_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("long_timeout_ms"));
        }
        if self.transport.long_timeout_ms < self.transport.timeout_ms {
            return Err(ConfigError::LongTimeoutTooShort {
                long: self.transport.long_timeout_ms,
                default: self.transport.timeout_ms,
            });
        }

        let listener = &self.listener;
        if listener.max_consecutive_errors == 0 {
            return Err(ConfigError::ZeroValue("max_consecutive_errors"));
        }
        if listener.base_backoff_ms > listener.max_backoff_ms {
            return Err(ConfigError::BackoffOrder {
                base: listener.base_backoff_ms,
                max: listener.max_backoff_ms,
            });
        }
        if listener.event_channel_capacity == 0 {
            return Err(ConfigError::ZeroValue("event_channel_capacity"));
        }
        if listener.watchdog_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("watchdog_interval_ms"));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Parses TOML. Overrides and validation are not applied.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.message().to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// The configuration the client runs with: the file at `path` (or the
    /// defaults if there is none), then environment overrides, then
    /// validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(contents) => {
                Self::from_toml(&contents).with_context(|| format!("Failed to load {}", path.display()))?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        config.apply_env_overrides();
        config
            .validate()
            .with_context(|| format!("Invalid configuration from {}", path.display()))?;
        Ok(config)
    }

    /// [`load`](Self::load) from [`config_path`].
    pub fn load_default() -> Result<Self> {
        Self::load(config_path())
    }

    /// Writes the configuration to `path`, replacing any existing file
    /// atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, self.to_toml()?).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        tracing::debug!("Configuration saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.client.device, "DESKTOPWIN");
        assert_eq!(config.transport.endpoint, "legy.line-apps.com");
        assert_eq!(config.transport.timeout(), Duration::from_secs(30));
        assert_eq!(config.transport.long_timeout(), Duration::from_secs(180));
        assert_eq!(config.listener.max_consecutive_errors, 10);
        assert_eq!(config.listener.max_restarts, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_storage_path() {
        let config = ClientConfig::default();
        assert!(config.storage_path.to_string_lossy().contains("linewire"));
        assert!(config.storage_path.ends_with("storage.json"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[client]
device = "IOSIPAD"

[listener]
square = false
max_restarts = 3
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.client.device, "IOSIPAD");
        assert!(!config.listener.square);
        assert_eq!(config.listener.max_restarts, 3);
        assert_eq!(config.transport.endpoint, "legy.line-apps.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[client\ndevice = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("invalid TOML: "));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[transport]
timeout_ms = "soon"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.client.app_version = Some("9.9.9".to_string());
        original.transport.scheme = "http".to_string();
        original.logging.directory = Some(PathBuf::from("/var/log/linewire"));

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[transport]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    fn clear_env() {
        for (name, _) in ENV_OVERRIDES {
            std::env::remove_var(name);
        }
        std::env::remove_var(CONFIG_PATH_ENV);
    }

    #[test]
    #[serial]
    fn test_missing_file_runs_on_defaults() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    #[serial]
    fn test_save_replaces_existing_file() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[client]\ndevice = \"IOSIPAD\"\n").unwrap();

        let mut config = Config::default();
        config.listener.sync_limit = 50;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    #[serial]
    fn test_load_reports_parse_error_with_path() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "invalid [ toml").unwrap();

        let err = Config::load(&path).unwrap_err();
        let chain = format!("{:#}", err);
        assert!(chain.contains("config.toml"), "{}", chain);
        assert!(chain.contains("invalid TOML"), "{}", chain);
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Parse(_))));
    }

    #[test]
    #[serial]
    fn test_load_applies_env_then_validates() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[transport]\nendpoint = \"file.example.test\"\n").unwrap();

        std::env::set_var("LINEWIRE_ENDPOINT", "env.example.test");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.transport.endpoint, "env.example.test");

        std::env::set_var("LINEWIRE_DEVICE", "TOASTER");
        let err = Config::load(&path).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::UnknownDevice("TOASTER".to_string()))
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_path_honours_env() {
        clear_env();
        assert!(config_path().ends_with("linewire/config.toml"));

        std::env::set_var(CONFIG_PATH_ENV, "/etc/linewire.toml");
        assert_eq!(config_path(), PathBuf::from("/etc/linewire.toml"));
        clear_env();
    }

    #[test]
    fn test_validate_rejects_unknown_device() {
        let mut config = Config::default();
        config.client.device = "TOASTER".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownDevice("TOASTER".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let mut config = Config::default();
        config.transport.scheme = "ftp".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidScheme("ftp".to_string()))
        );
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = Config::default();
        config.transport.timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("timeout_ms")));

        let mut config = Config::default();
        config.transport.long_timeout_ms = 1_000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::LongTimeoutTooShort {
                long: 1_000,
                default: 30_000
            })
        );
    }

    #[test]
    fn test_validate_listener_values() {
        let mut config = Config::default();
        config.listener.max_consecutive_errors = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.listener.base_backoff_ms = 120_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffOrder { .. })
        ));

        let mut config = Config::default();
        config.listener.event_channel_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("event_channel_capacity"))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());
        config.logging.level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("LINEWIRE_ENDPOINT", "gw.example.test");
        std::env::set_var("LINEWIRE_DEVICE", "ANDROID");
        std::env::set_var("LINEWIRE_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.transport.endpoint, "gw.example.test");
        assert_eq!(config.client.device, "ANDROID");
        assert_eq!(config.logging.level, "debug");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("LINEWIRE_ENDPOINT", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
        clear_env();
    }
}
