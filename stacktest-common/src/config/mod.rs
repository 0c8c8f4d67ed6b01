//! Harness configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `STACKTEST_*` environment variables. Command-line flags are applied on
//! top by the binary.

pub mod env;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use env::{EnvError, EnvParser};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid environment configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for a full stack run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Repository root containing `docker/launch.sh` and the compose dirs.
    pub stack_root: PathBuf,
    /// Compose environment passed to the launch script.
    pub environment: String,
    pub graphite_url: String,
    pub grafana_url: String,
    pub grafana_user: Option<String>,
    pub grafana_password: Option<String>,
    /// `host:port` of the carbon plaintext listener.
    pub carbon_addr: String,
    pub metrics_per_second: u32,
    #[serde(with = "duration_str")]
    pub startup_timeout: Duration,
    pub poll_attempts: u32,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub http_timeout: Duration,
    /// Directory receiving one log file per tracked stream.
    pub log_dir: Option<PathBuf>,
    /// Echo tracked output through the log.
    pub echo_output: bool,
    pub log_level: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_root: PathBuf::from("."),
            environment: "docker-dev".to_string(),
            graphite_url: "http://localhost:8080".to_string(),
            grafana_url: "http://localhost:3000".to_string(),
            grafana_user: Some("admin".to_string()),
            grafana_password: Some("admin".to_string()),
            carbon_addr: "localhost:2003".to_string(),
            metrics_per_second: 1000,
            startup_timeout: Duration::from_secs(40),
            poll_attempts: 18,
            poll_interval: Duration::from_secs(1),
            http_timeout: Duration::from_secs(5),
            log_dir: None,
            echo_output: false,
            log_level: "info".to_string(),
        }
    }
}

impl StackConfig {
    /// Load defaults, the optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Override fields from `STACKTEST_*` variables.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        if let Some(v) = parser.get_path("STACK_ROOT") {
            self.stack_root = v;
        }
        if let Some(v) = parser.get_string("ENVIRONMENT") {
            self.environment = v;
        }
        if let Some(v) = parser.get_string("GRAPHITE_URL") {
            self.graphite_url = v;
        }
        if let Some(v) = parser.get_string("GRAFANA_URL") {
            self.grafana_url = v;
        }
        if let Some(v) = parser.get_optional_string("GRAFANA_USER") {
            self.grafana_user = v;
        }
        if let Some(v) = parser.get_optional_string("GRAFANA_PASSWORD") {
            self.grafana_password = v;
        }
        if let Some(v) = parser.get_string("CARBON_ADDR") {
            self.carbon_addr = v;
        }
        if let Some(v) = parser.get_u32_range("METRICS_PER_SECOND", 1, 10_000_000) {
            self.metrics_per_second = v;
        }
        if let Some(v) = parser.get_duration("STARTUP_TIMEOUT") {
            self.startup_timeout = v;
        }
        if let Some(v) = parser.get_u32_range("POLL_ATTEMPTS", 1, 100_000) {
            self.poll_attempts = v;
        }
        if let Some(v) = parser.get_duration("POLL_INTERVAL") {
            self.poll_interval = v;
        }
        if let Some(v) = parser.get_duration("HTTP_TIMEOUT") {
            self.http_timeout = v;
        }
        if let Some(v) = parser.get_path("LOG_DIR") {
            self.log_dir = Some(v);
        }
        if let Some(v) = parser.get_bool("ECHO_OUTPUT") {
            self.echo_output = v;
        }
        if let Some(v) = parser.get_log_level("LOG_LEVEL") {
            self.log_level = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_per_second == 0 {
            return Err(ConfigError::Invalid(
                "metrics_per_second must be > 0".to_string(),
            ));
        }
        if self.poll_attempts == 0 {
            return Err(ConfigError::Invalid("poll_attempts must be > 0".to_string()));
        }
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Invalid("environment must not be empty".to_string()));
        }
        Ok(())
    }

    /// Grafana credentials when both user and password are configured.
    pub fn grafana_credentials(&self) -> Option<(&str, &str)> {
        match (&self.grafana_user, &self.grafana_password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

/// Serde adapter storing durations as humantime strings (`"40s"`).
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock, PoisonError};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}
