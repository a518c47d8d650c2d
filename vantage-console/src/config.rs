//! Configuration loading for the Vantage console.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use vantage_cache::{CacheConfig, FetchRetry};

use crate::nav::ProjectRoute;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub auth: AuthConfig,
    /// Location opened when nothing was persisted, e.g.
    /// `https://console.example/projects/7/overview`.
    pub start_url: String,
    pub persistence_path: PathBuf,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Optional. Without it values stay fresh until invalidated.
    pub stale_after_ms: Option<u64>,
    pub fetch_retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub attempts: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or VANTAGE_CONSOLE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConsoleConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ConsoleConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if let Err(err) = Url::parse(&self.api_base_url) {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: err.to_string(),
            });
        }
        if self.auth.api_key.is_none() && self.auth.bearer_token.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "auth",
                reason: "api_key or bearer_token must be provided".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        self.start_location()?;
        if self.persistence_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "persistence_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cache.stale_after_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "cache.stale_after_ms",
                reason: "must be > 0 when set".to_string(),
            });
        }
        let retry = &self.cache.fetch_retry;
        if retry.attempts > 0 && retry.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.fetch_retry.initial_ms",
                reason: "must be > 0 when attempts > 0".to_string(),
            });
        }
        if retry.max_ms < retry.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "cache.fetch_retry.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.fetch_retry.multiplier",
                reason: "must be a finite number >= 1.0".to_string(),
            });
        }
        Ok(())
    }

    /// The configured start URL. Must be a project route.
    pub fn start_location(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.start_url).map_err(|err| ConfigError::InvalidValue {
            field: "start_url",
            reason: err.to_string(),
        })?;
        if ProjectRoute::parse(&url).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "start_url",
                reason: "must be a /projects/{id}/{tab} route".to_string(),
            });
        }
        Ok(url)
    }

    pub fn cache_config(&self) -> CacheConfig {
        let retry = &self.cache.fetch_retry;
        let config = CacheConfig::new().with_retry(FetchRetry {
            attempts: retry.attempts,
            initial_delay: Duration::from_millis(retry.initial_ms),
            max_delay: Duration::from_millis(retry.max_ms),
            multiplier: retry.multiplier,
        });
        match self.cache.stale_after_ms {
            Some(ms) => config.with_max_age(Duration::from_millis(ms)),
            None => config,
        }
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("VANTAGE_CONSOLE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
