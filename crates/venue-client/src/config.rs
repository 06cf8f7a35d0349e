//! Client configuration types and loading
//!
//! Precedence: env vars > config file > defaults. The config path comes from
//! the caller, then `CONFIG_PATH`, then `venue-client.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var overriding `api.base_url` (lets staging builds reuse one file).
pub const BASE_URL_ENV: &str = "VENUE_API_BASE_URL";

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// Backend location and dispatch policy
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Absolute per-dispatch timeout, refresh calls included
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Where durable credentials live. Without a path both tiers are in memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub durable_path: Option<PathBuf>,
}

/// Header added to every outbound request
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

fn default_timeout() -> u64 {
    30
}

impl ClientConfig {
    /// Defaults for a programmatic client talking to `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiConfig {
                base_url: base_url.into(),
                timeout_secs: default_timeout(),
            },
            storage: StorageConfig::default(),
            headers: Vec::new(),
        }
    }

    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse, apply env overrides and validate.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: ClientConfig = toml::from_str(contents)?;

        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            let base_url = base_url.trim().to_owned();
            if !base_url.is_empty() {
                config.api.base_url = base_url;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    /// Resolve config file path from an explicit path or CONFIG_PATH env var.
    pub fn resolve_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("venue-client.toml")
    }
}
