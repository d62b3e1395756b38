//! # sa-config
//!
//! Layered settings for the skyarchive binary: built-in defaults, then an
//! optional `skyarchive.toml`, then `SKYARCHIVE__*` environment variables
//! (nested keys use `__`, e.g. `SKYARCHIVE__RATE_LIMIT__QUOTA`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "skyarchive.toml";
pub const ENV_PREFIX: &str = "SKYARCHIVE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub quota: u32,
    /// Defaults to a tenth of the quota
    #[serde(default)]
    pub burst: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub media_path: PathBuf,
    pub export_path: PathBuf,
    /// Base URL of the XRPC service
    pub service_url: String,
    /// Opaque bearer token; public endpoints work without one
    #[serde(default)]
    pub access_token: Option<SecretString>,
    pub rate_limit: RateLimitSettings,
    /// `0` selects the fetcher's default
    pub page_size: u32,
    pub export_batch_size: u64,
    pub log_format: LogFormat,
}

impl Settings {
    /// Loads `.env`, then `config_file` (or `skyarchive.toml` when present),
    /// then the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(err) if err.not_found() => {}
            Err(err) => tracing::warn!(error = %err, "ignoring unreadable .env"),
        }
        Self::from_sources(config_file, None)
    }

    /// `env` replaces the process environment when given.
    pub fn from_sources(config_file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: Settings = Config::builder()
            .set_default("database_url", "sqlite://skyarchive.db")?
            .set_default("media_path", "data/media")?
            .set_default("export_path", "data/exports")?
            .set_default("service_url", "https://public.api.bsky.app")?
            .set_default("rate_limit.window_secs", 300)?
            .set_default("rate_limit.quota", 3000)?
            .set_default("page_size", 50)?
            .set_default("export_batch_size", 1000)?
            .set_default("log_format", "pretty")?
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("database_url is empty".into()));
        }
        if self.service_url.trim().is_empty() {
            return Err(ConfigError::Invalid("service_url is empty".into()));
        }
        if self.media_path.as_os_str().is_empty() || self.export_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("media_path and export_path must be set".into()));
        }
        if self.rate_limit.quota == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit quota and window_secs must be positive".into()));
        }
        if self.export_batch_size == 0 {
            return Err(ConfigError::Invalid("export_batch_size must be positive".into()));
        }
        Ok(())
    }
}
