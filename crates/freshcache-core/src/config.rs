//! Application configuration management.
//!
//! Configuration is stored at `<config_dir>/freshcache/config.json`. Every
//! field has a default, so a partial (or missing) file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::mutation::BatchConfig;
use crate::realtime::ChannelConfig;
use crate::retry::RetryConfig;

/// Application name used for config directory paths
const APP_NAME: &str = "freshcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Entries older than this are refetched on next read.
const DEFAULT_STALE_AFTER_SECS: u64 = 60 * 60;

pub const ENV_API_URL: &str = "FRESHCACHE_API_URL";
pub const ENV_WS_URL: &str = "FRESHCACHE_WS_URL";
pub const ENV_REALTIME: &str = "FRESHCACHE_REALTIME";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `None` keeps entries fresh until invalidated.
    pub stale_after_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: Some(DEFAULT_STALE_AFTER_SECS),
        }
    }
}

impl CacheConfig {
    pub fn build_store(&self) -> CacheStore {
        match self.stale_after_secs {
            Some(secs) => CacheStore::new().with_stale_after(Duration::from_secs(secs)),
            None => CacheStore::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub realtime: ChannelConfig,
    pub cache: CacheConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `FRESHCACHE_*` environment variables on top of the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.is_empty()) {
            self.api_base_url = Some(url);
        }
        if let Some(url) = lookup(ENV_WS_URL).filter(|v| !v.is_empty()) {
            self.realtime.url = Some(url);
        }
        if let Some(flag) = lookup(ENV_REALTIME) {
            let flag = flag.trim().to_ascii_lowercase();
            self.realtime.enabled = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<()> {
        let retry = &self.retry;
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            bail!("retry.backoff_factor must be at least 1.0 (got {})", retry.backoff_factor);
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            bail!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                retry.max_delay_ms,
                retry.base_delay_ms
            );
        }
        if self.batch.batch_size == 0 {
            bail!("batch.batch_size must be greater than zero");
        }
        if self.realtime.enabled && self.realtime.url.as_deref().map_or(true, str::is_empty) {
            bail!("realtime.url is required when the real-time channel is enabled");
        }
        if self.realtime.refetch_interval_ms == 0 {
            bail!("realtime.refetch_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.api_base_url = Some("https://api.example.com".into());
        config.retry.max_retries = 5;
        config.batch.batch_size = 50;

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let contents = r#"{"realtime": {"enabled": true, "url": "wss://push.example.com"}}"#;
        std::fs::write(&path, contents).unwrap();

        let config = Config::load_from(&path).unwrap();

        assert!(config.realtime.enabled);
        assert_eq!(config.realtime.max_reconnect_attempts, 5);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_API_URL, "https://staging.example.com"),
            (ENV_WS_URL, "wss://staging.example.com/ws"),
            (ENV_REALTIME, "TRUE"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();

        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.api_base_url.as_deref(), Some("https://staging.example.com"));
        assert_eq!(config.realtime.url.as_deref(), Some("wss://staging.example.com/ws"));
        assert!(config.realtime.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.batch.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.realtime.enabled = true;
        assert!(config.validate().is_err());
    }
}
