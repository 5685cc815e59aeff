use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid max_queue_depth: {0}. Must be at least 1")]
    InvalidQueueDepth(usize),

    #[error("Invalid {field}: {value}. Must be at least 1")]
    InvalidProcessorSetting { field: &'static str, value: usize },

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error(
        "Invalid retry delays: base_retry_delay_ms ({0}) must not exceed max_retry_delay_ms ({1})"
    )]
    InvalidRetryDelay(u64, u64),

    #[error("Invalid {field}: {value}. Must be between 0.0 and 1.0")]
    InvalidRatio { field: &'static str, value: f64 },

    #[error("Invalid backoff_multiplier: {0}. Must be at least 1.0")]
    InvalidBackoffMultiplier(f64),

    #[error("Invalid max_dlq_size: {0}. Must be at least 1")]
    InvalidDeadLetterSize(usize),

    #[error("Invalid {field}: must be at least 1")]
    InvalidBreakerSetting { field: &'static str },

    #[error("Invalid timeout_ms: {0}. Must be at least 1")]
    InvalidTimeout(u64),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .bulwark/config.yaml (project config)
    /// 3. .bulwark/local.yaml (project local overrides, optional)
    /// 4. Environment variables (BULWARK_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".bulwark/config.yaml"))
            .merge(Yaml::file(".bulwark/local.yaml"))
            .merge(Env::prefixed("BULWARK_").split("__"))
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("BULWARK_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let logging = &config.logging;
        if !["trace", "debug", "info", "warn", "error"].contains(&logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(logging.level.clone()));
        }
        if !["json", "pretty"].contains(&logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(logging.format.clone()));
        }
        if !["daily", "hourly", "never"].contains(&logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(logging.rotation.clone()));
        }

        if config.queue.max_queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth(config.queue.max_queue_depth));
        }

        let processor = &config.processor;
        for (field, value) in [
            ("batch_size", processor.batch_size),
            ("chunk_size", processor.chunk_size),
            ("max_concurrent", processor.max_concurrent),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidProcessorSetting { field, value });
            }
        }

        let retry = &config.retry;
        if retry.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(retry.max_retries));
        }
        if retry.base_retry_delay_ms > retry.max_retry_delay_ms {
            return Err(ConfigError::InvalidRetryDelay(
                retry.base_retry_delay_ms,
                retry.max_retry_delay_ms,
            ));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(
                retry.backoff_multiplier,
            ));
        }

        let breaker = &config.circuit_breaker;
        for (field, value) in [
            ("jitter_ratio", retry.jitter_ratio),
            ("failure_rate_threshold", breaker.failure_rate_threshold),
            ("slow_call_rate_threshold", breaker.slow_call_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidRatio { field, value });
            }
        }
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidBreakerSetting {
                field: "failure_threshold",
            });
        }
        if breaker.success_threshold == 0 {
            return Err(ConfigError::InvalidBreakerSetting {
                field: "success_threshold",
            });
        }
        if breaker.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(breaker.timeout_ms));
        }

        if config.dead_letter.max_dlq_size == 0 {
            return Err(ConfigError::InvalidDeadLetterSize(
                config.dead_letter.max_dlq_size,
            ));
        }
        if config.middleware.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(config.middleware.timeout_ms));
        }

        Ok(())
    }
}
