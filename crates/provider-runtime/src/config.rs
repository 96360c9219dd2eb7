//! Provider configuration with validation.
//!
//! Loaded from an optional TOML file named by `TASKMESH_CONFIG`, then
//! overridden field by field from `TASKMESH_*` environment variables.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "TASKMESH_CONFIG";

/// Main provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Name reported in logs and on `/health`
    pub service_name: String,
    /// Address the HTTP listener binds to
    pub listen_addr: SocketAddr,
    /// Base URL peers use to reach this provider (defaults to the bound address)
    pub advertise_url: Option<Url>,
    /// Coordinator that routes requests without an explicit task URL
    pub coordinator_url: Option<Url>,
    /// Default timeout for requests sent through this provider's tracker
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Root directory for exposed stream sockets
    pub stream_dir: PathBuf,
    /// How long an exposed stream waits for its consumer
    #[serde(with = "humantime_serde")]
    pub stream_accept_timeout: Duration,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            service_name: "taskmesh-provider".to_string(),
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7070),
            advertise_url: None,
            coordinator_url: None,
            request_timeout: shared_bus::DEFAULT_REQUEST_TIMEOUT,
            stream_dir: std::env::temp_dir().join("taskmesh"),
            stream_accept_timeout: Duration::from_secs(300),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`info`, `provider_runtime=debug`, ...). `RUST_LOG` wins if set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ProviderConfig {
    /// Load configuration from the file named by `TASKMESH_CONFIG` (if any)
    /// and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `TASKMESH_*` overrides read through `lookup`.
    ///
    /// # Environment Variables
    ///
    /// - `TASKMESH_SERVICE_NAME`
    /// - `TASKMESH_LISTEN_ADDR`: socket address, e.g. `0.0.0.0:7070`
    /// - `TASKMESH_ADVERTISE_URL`
    /// - `TASKMESH_COORDINATOR_URL`
    /// - `TASKMESH_REQUEST_TIMEOUT`: humantime duration, e.g. `30s`
    /// - `TASKMESH_STREAM_DIR`
    /// - `TASKMESH_STREAM_ACCEPT_TIMEOUT`: humantime duration
    /// - `TASKMESH_LOG_LEVEL`
    /// - `TASKMESH_JSON_LOGS`: `true`/`false`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("TASKMESH_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(addr) = lookup("TASKMESH_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .map_err(|_| ConfigError::invalid_env("TASKMESH_LISTEN_ADDR", &addr))?;
        }
        if let Some(url) = lookup("TASKMESH_ADVERTISE_URL") {
            self.advertise_url = Some(parse_url("TASKMESH_ADVERTISE_URL", &url)?);
        }
        if let Some(url) = lookup("TASKMESH_COORDINATOR_URL") {
            self.coordinator_url = Some(parse_url("TASKMESH_COORDINATOR_URL", &url)?);
        }
        if let Some(timeout) = lookup("TASKMESH_REQUEST_TIMEOUT") {
            self.request_timeout = humantime::parse_duration(&timeout)
                .map_err(|_| ConfigError::invalid_env("TASKMESH_REQUEST_TIMEOUT", &timeout))?;
        }
        if let Some(dir) = lookup("TASKMESH_STREAM_DIR") {
            self.stream_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = lookup("TASKMESH_STREAM_ACCEPT_TIMEOUT") {
            self.stream_accept_timeout = humantime::parse_duration(&timeout).map_err(|_| {
                ConfigError::invalid_env("TASKMESH_STREAM_ACCEPT_TIMEOUT", &timeout)
            })?;
        }
        if let Some(level) = lookup("TASKMESH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("TASKMESH_JSON_LOGS") {
            self.logging.json = json
                .parse()
                .map_err(|_| ConfigError::invalid_env("TASKMESH_JSON_LOGS", &json))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service_name cannot be empty".into()));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "request_timeout must be greater than zero".into(),
            ));
        }
        if self.stream_accept_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "stream_accept_timeout must be greater than zero".into(),
            ));
        }

        if !self.stream_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "stream_dir must be absolute: {}",
                self.stream_dir.display()
            )));
        }

        for url in [&self.advertise_url, &self.coordinator_url].into_iter().flatten() {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "unsupported URL scheme: {url}"
                )));
            }
        }

        Ok(())
    }

    /// Stream directory for one task, so each task's sockets live apart.
    pub fn stream_dir_for(&self, task: &str) -> PathBuf {
        self.stream_dir.join(task)
    }
}

fn parse_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|_| ConfigError::invalid_env(key, value))
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("cannot read {path}: {message}")]
    Io { path: PathBuf, message: String },
    /// Configuration file is not valid TOML for this schema
    #[error("invalid configuration file: {0}")]
    Parse(String),
    /// An environment override could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid_env(key: &'static str, value: &str) -> Self {
        Self::InvalidEnv {
            key,
            value: value.to_string(),
        }
    }
}
