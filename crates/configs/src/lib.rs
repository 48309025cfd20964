//! # Settings
//!
//! Layered configuration: `.env` (optional), then `config/default.toml`
//! (optional), then `KARMA__*` environment variables, e.g.
//! `KARMA__DATABASE__URL` or `KARMA__VOTING__RATE_LIMITS_ENABLED`.

use chrono::Duration;
use config::{Config, Environment, File, FileFormat};
use domains::CollectionName;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use services::VotingConfig;
use thiserror::Error;
use tracing::debug;

pub const ENV_PREFIX: &str = "KARMA";
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid value {value} for voting.{key}")]
    Invalid { key: &'static str, value: i64 },
}

fn secret_string<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub logging: LogSettings,
    #[serde(default)]
    pub voting: VotingSettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    #[serde(deserialize_with = "secret_string")]
    pub url: SecretString,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG` when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VotingSettings {
    pub rate_limits_enabled: bool,
    pub history_window_hours: i64,
    pub warning_cooldown_minutes: i64,
    pub search_indexed_collections: Vec<CollectionName>,
    pub rescore_inactive_after_days: i64,
}

impl Default for VotingSettings {
    fn default() -> Self {
        let engine = VotingConfig::default();
        Self {
            rate_limits_enabled: engine.rate_limits_enabled,
            history_window_hours: engine.history_window_hours,
            warning_cooldown_minutes: engine.warning_cooldown_minutes,
            search_indexed_collections: engine.search_indexed_collections,
            rescore_inactive_after_days: engine.rescore_inactive_after_days,
        }
    }
}

/// Rejects non-positive values and values too large to be a `chrono::Duration`.
fn check_duration(key: &'static str, value: i64, to_duration: fn(i64) -> Option<Duration>) -> Result<(), ConfigError> {
    if value <= 0 || to_duration(value).is_none() {
        return Err(ConfigError::Invalid { key, value });
    }
    Ok(())
}

impl VotingSettings {
    pub fn to_engine_config(&self) -> Result<VotingConfig, ConfigError> {
        check_duration("history_window_hours", self.history_window_hours, Duration::try_hours)?;
        check_duration("warning_cooldown_minutes", self.warning_cooldown_minutes, Duration::try_minutes)?;
        check_duration("rescore_inactive_after_days", self.rescore_inactive_after_days, Duration::try_days)?;
        Ok(VotingConfig {
            rate_limits_enabled: self.rate_limits_enabled,
            history_window_hours: self.history_window_hours,
            warning_cooldown_minutes: self.warning_cooldown_minutes,
            search_indexed_collections: self.search_indexed_collections.clone(),
            rescore_inactive_after_days: self.rescore_inactive_after_days,
        })
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("voting.search_indexed_collections")
        .try_parsing(true)
}

impl Settings {
    /// Loads settings from the default file location and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            debug!(error = %err, "no .env file loaded");
        }
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Parses settings from TOML text alone, without files or environment.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
