use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Environment error: {0}")]
    EnvError(String),
}

/// Configuration for the telemetry transmission channel.
///
/// Loadable from a TOML file via [`ChannelConfig::from_file`]; individual
/// fields can be overridden through `TELEMETRY_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ingestion endpoint receiving telemetry batches.
    pub endpoint: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Immediate resend attempts allowed per transmission before failing over.
    pub max_instant_retries: u32,
    pub batch: BatchConfig,
    pub backoff: BackoffConfig,
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_interval_ms: u64,
    /// Pending items beyond this are dropped oldest-first.
    pub max_pending_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub jitter: bool,
}

/// Configuration for the application-id profile resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Base address of the profile query service.
    pub endpoint: String,
    pub max_instant_retries: u32,
    /// Interval after which failure counters and pending lookups are cleared.
    pub reset_period_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://dc.services.visualstudio.com/v2/track".to_string(),
            user_agent: concat!("telemetry-channel/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_instant_retries: 3,
            batch: BatchConfig::default(),
            backoff: BackoffConfig::default(),
            profile: ProfileConfig::default(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_batch_interval_ms: 5000,
            max_pending_items: 10_000,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_secs: 60,
            jitter: true,
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://dc.services.visualstudio.com".to_string(),
            max_instant_retries: 3,
            reset_period_secs: 4 * 60 * 60,
        }
    }
}

impl ChannelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Applies `TELEMETRY_*` environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(endpoint) = std::env::var("TELEMETRY_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("TELEMETRY_PROFILE_ENDPOINT") {
            self.profile.endpoint = endpoint;
        }
        if let Ok(raw) = std::env::var("TELEMETRY_MAX_INSTANT_RETRIES") {
            self.max_instant_retries = raw.parse().map_err(|_| {
                ConfigError::EnvError(format!(
                    "TELEMETRY_MAX_INSTANT_RETRIES must be an integer, got '{raw}'"
                ))
            })?;
        }
        if let Ok(raw) = std::env::var("TELEMETRY_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = raw.parse().map_err(|_| {
                ConfigError::EnvError(format!(
                    "TELEMETRY_REQUEST_TIMEOUT_SECS must be an integer, got '{raw}'"
                ))
            })?;
        }
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;

        Url::parse(&self.profile.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!(
                "Invalid profile endpoint URL '{}': {}",
                self.profile.endpoint, e
            ))
        })?;

        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.batch.max_pending_items < self.batch.max_batch_size {
            return Err(ConfigError::InvalidConfig(format!(
                "Pending item capacity ({}) must be at least as large as batch size ({})",
                self.batch.max_pending_items, self.batch.max_batch_size
            )));
        }

        if self.request_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request and connect timeouts must be greater than 0".to_string(),
            ));
        }

        if self.backoff.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Initial backoff must be greater than 0".to_string(),
            ));
        }

        if self.profile.max_instant_retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "Profile retry cap must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl BatchConfig {
    pub fn max_batch_interval(&self) -> Duration {
        Duration::from_millis(self.max_batch_interval_ms)
    }
}

impl BackoffConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl ProfileConfig {
    pub fn reset_period(&self) -> Duration {
        Duration::from_secs(self.reset_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ChannelConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let config = ChannelConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_pending_capacity_below_batch_size() {
        let mut config = ChannelConfig::default();
        config.batch.max_batch_size = 100;
        config.batch.max_pending_items = 50;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint = \"http://localhost:9090/v2/track\"").unwrap();
        writeln!(file, "[backoff]").unwrap();
        writeln!(file, "jitter = false").unwrap();

        let config = ChannelConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint, "http://localhost:9090/v2/track");
        assert!(!config.backoff.jitter);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            ChannelConfig::from_file("/nonexistent/channel.toml"),
            Err(ConfigError::FileError(_))
        ));
    }

    #[test]
    fn parses_toml() {
        let raw = r#"
            endpoint = "http://localhost:8080/v2/track"
            max_instant_retries = 5

            [batch]
            max_batch_size = 50
        "#;
        let config: ChannelConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.endpoint, "http://localhost:8080/v2/track");
        assert_eq!(config.max_instant_retries, 5);
        assert_eq!(config.batch.max_batch_size, 50);
        // Unspecified fields keep defaults
        assert_eq!(config.request_timeout_secs, 30);
    }
}
