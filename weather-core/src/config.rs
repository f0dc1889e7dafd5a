use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

use crate::{
    provider::openweather::{DEFAULT_BASE_URL, require_https},
    rate_limit,
    retry::{self, RetryPolicy},
};

/// Environment variable that overrides the stored API key.
pub const API_KEY_ENV: &str = "OWM_API_KEY";

/// Upstream provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { api_key: None, base_url: DEFAULT_BASE_URL.to_string() }
    }
}

/// Timeouts and retry behaviour for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Overall bound for one fetch: rate-limiter wait plus every attempt.
    pub request_timeout_secs: u64,
    /// Bound for a single provider call.
    pub attempt_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            attempt_timeout_secs: retry::DEFAULT_ATTEMPT_TIMEOUT.as_secs(),
            max_attempts: retry::DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: retry::DEFAULT_BASE_DELAY.as_millis() as u64,
            retry_multiplier: retry::DEFAULT_MULTIPLIER,
            retry_max_delay_ms: retry::DEFAULT_MAX_DELAY.as_millis() as u64,
            retry_jitter: true,
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: self.retry_jitter,
            attempt_timeout: self.attempt_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Defaults to `weather_cache.db` in the platform data directory.
    pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 600, sweep_interval_secs: 300, db_path: None }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: rate_limit::DEFAULT_CAPACITY,
            window_secs: rate_limit::DEFAULT_WINDOW.as_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// [provider]
/// api_key = "..."
///
/// [cache]
/// ttl_secs = 600
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load config from disk, or return defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            // First run: no config file, return defaults.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "weather-task", "weather-cli")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Path to the cache database: explicit `cache.db_path`, else the platform data dir.
    pub fn cache_db_path(&self) -> Result<PathBuf> {
        match &self.cache.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("weather_cache.db")),
        }
    }

    /// Reject settings the fetch pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        require_https(&self.provider.base_url)?;

        if self.fetch.max_attempts == 0 {
            bail!("fetch.max_attempts must be at least 1");
        }
        if self.fetch.attempt_timeout_secs == 0 {
            bail!("fetch.attempt_timeout_secs must be at least 1");
        }
        if self.fetch.attempt_timeout_secs >= self.fetch.request_timeout_secs {
            bail!(
                "fetch.attempt_timeout_secs ({}) must be smaller than fetch.request_timeout_secs ({})",
                self.fetch.attempt_timeout_secs,
                self.fetch.request_timeout_secs
            );
        }
        if self.fetch.retry_multiplier.is_nan() || self.fetch.retry_multiplier < 1.0 {
            bail!("fetch.retry_multiplier must be >= 1.0");
        }
        if self.cache.ttl_secs == 0 {
            bail!("cache.ttl_secs must be at least 1");
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.window_secs == 0 {
            bail!("rate_limit.capacity and rate_limit.window_secs must be at least 1");
        }

        Ok(())
    }

    /// Set or replace the stored API key.
    pub fn set_api_key(&mut self, api_key: String) {
        self.provider.api_key = Some(api_key);
    }

    /// API key from `OWM_API_KEY`, falling back to the stored one.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_with_override(std::env::var(API_KEY_ENV).ok())
    }

    pub fn api_key_with_override(&self, env_value: Option<String>) -> Option<String> {
        env_value
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .or_else(|| self.provider.api_key.clone().filter(|k| !k.trim().is_empty()))
    }

    pub fn is_api_key_configured(&self) -> bool {
        self.api_key().is_some()
    }
}
