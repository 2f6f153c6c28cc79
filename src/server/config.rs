use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::db::RetryPolicy;
use crate::notifications::encryption::ChannelCipher;
use crate::notifications::senders::email::SmtpSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_store_retry_base_ms")]
    pub store_retry_base_ms: u64,
    #[serde(default = "default_status_retention_days")]
    pub status_retention_days: u32,
    #[serde(default = "default_retention_interval_seconds")]
    pub retention_interval_seconds: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub channel_encryption_key: Option<String>,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_from: Option<String>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialAppConfig {
    region: Option<String>,
    database_url: Option<String>,
    database_max_connections: Option<u32>,
    tick_seconds: Option<u64>,
    probe_timeout_seconds: Option<u64>,
    store_retry_attempts: Option<u32>,
    store_retry_base_ms: Option<u64>,
    status_retention_days: Option<u32>,
    retention_interval_seconds: Option<u64>,
    log_dir: Option<String>,
    channel_encryption_key: Option<String>,
    smtp_host: Option<String>,
    smtp_port: Option<u16>,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    smtp_from: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_probe_timeout_seconds() -> u64 {
    60
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_base_ms() -> u64 {
    200
}

fn default_status_retention_days() -> u32 {
    30
}

fn default_retention_interval_seconds() -> u64 {
    3600
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            database_url: None,
            database_max_connections: default_max_connections(),
            tick_seconds: default_tick_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_base_ms: default_store_retry_base_ms(),
            status_retention_days: default_status_retention_days(),
            retention_interval_seconds: default_retention_interval_seconds(),
            log_dir: default_log_dir(),
            channel_encryption_key: None,
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            smtp_from: None,
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional TOML file, then environment variables
    /// (after `.env`), each layer overriding the previous one.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let file_config = read_file(config_path)?;
        let env_config: PartialAppConfig = envy::from_env()?;
        merge(file_config, env_config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_retry_attempts,
            Duration::from_millis(self.store_retry_base_ms),
        )
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn status_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.status_retention_days))
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_seconds)
    }

    /// Email delivery needs at least a relay host and a sender address.
    pub fn smtp_settings(&self) -> Option<SmtpSettings> {
        Some(SmtpSettings {
            host: self.smtp_host.clone()?,
            port: self.smtp_port,
            username: self.smtp_username.clone(),
            password: self.smtp_password.clone(),
            from: self.smtp_from.clone()?,
        })
    }

    pub fn channel_cipher(&self) -> Result<Option<ChannelCipher>, ConfigError> {
        self.channel_encryption_key
            .as_deref()
            .map(|key| {
                ChannelCipher::from_hex_key(key).map_err(|e| {
                    ConfigError::Invalid(format!("channel_encryption_key: {e}"))
                })
            })
            .transpose()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::Invalid("region must not be empty".to_string()));
        }
        // Every minute boundary must land on a tick or due monitors are skipped.
        if self.tick_seconds == 0 || 60 % self.tick_seconds != 0 {
            return Err(ConfigError::Invalid(format!(
                "tick_seconds must divide 60, got {}",
                self.tick_seconds
            )));
        }
        if self.probe_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "probe_timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.status_retention_days == 0 {
            return Err(ConfigError::Invalid(
                "status_retention_days must be at least 1".to_string(),
            ));
        }
        if self.retention_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "retention_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.database_max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database_max_connections must be at least 1".to_string(),
            ));
        }
        self.channel_cipher()?;
        Ok(())
    }
}

fn read_file(config_path: Option<&str>) -> Result<PartialAppConfig, ConfigError> {
    let Some(path_str) = config_path else {
        return Ok(PartialAppConfig::default());
    };
    let path = Path::new(path_str);
    if !path.exists() {
        return Ok(PartialAppConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path_str.to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path_str.to_string(),
        source,
    })
}

// Environment overrides file
fn merge(file: PartialAppConfig, env: PartialAppConfig) -> Result<AppConfig, ConfigError> {
    let defaults = AppConfig::default();
    let config = AppConfig {
        region: env.region.or(file.region).unwrap_or(defaults.region),
        database_url: env.database_url.or(file.database_url),
        database_max_connections: env
            .database_max_connections
            .or(file.database_max_connections)
            .unwrap_or(defaults.database_max_connections),
        tick_seconds: env
            .tick_seconds
            .or(file.tick_seconds)
            .unwrap_or(defaults.tick_seconds),
        probe_timeout_seconds: env
            .probe_timeout_seconds
            .or(file.probe_timeout_seconds)
            .unwrap_or(defaults.probe_timeout_seconds),
        store_retry_attempts: env
            .store_retry_attempts
            .or(file.store_retry_attempts)
            .unwrap_or(defaults.store_retry_attempts),
        store_retry_base_ms: env
            .store_retry_base_ms
            .or(file.store_retry_base_ms)
            .unwrap_or(defaults.store_retry_base_ms),
        status_retention_days: env
            .status_retention_days
            .or(file.status_retention_days)
            .unwrap_or(defaults.status_retention_days),
        retention_interval_seconds: env
            .retention_interval_seconds
            .or(file.retention_interval_seconds)
            .unwrap_or(defaults.retention_interval_seconds),
        log_dir: env.log_dir.or(file.log_dir).unwrap_or(defaults.log_dir),
        channel_encryption_key: env.channel_encryption_key.or(file.channel_encryption_key),
        smtp_host: env.smtp_host.or(file.smtp_host),
        smtp_port: env
            .smtp_port
            .or(file.smtp_port)
            .unwrap_or(defaults.smtp_port),
        smtp_username: env.smtp_username.or(file.smtp_username),
        smtp_password: env.smtp_password.or(file.smtp_password),
        smtp_from: env.smtp_from.or(file.smtp_from),
    };
    config.validate()?;
    Ok(config)
}
