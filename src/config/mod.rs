use crate::{constants, Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr};

/// Top-level runtime configuration, loaded from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub cleanup_interval_seconds: u64,
    pub instance_timeout_seconds: u64,
    pub max_history: usize,
    pub task_timeout_seconds: u64,
    pub mq: MqConfig,
    pub api: ApiConfig,
}

/// Message queue backend selection and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqConfig {
    pub backend: MqBackend,
    pub max_queue_size: usize,
    pub stream_queue_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MqBackend {
    Memory,
    Redis,
    Amqp,
}

impl FromStr for MqBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(MqBackend::Memory),
            "redis" => Ok(MqBackend::Redis),
            "amqp" => Ok(MqBackend::Amqp),
            _ => Err(format!("unknown MQ backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: constants::DEFAULT_WORKERS,
            cleanup_interval_seconds: constants::DEFAULT_CLEANUP_INTERVAL_SECS,
            instance_timeout_seconds: constants::DEFAULT_INSTANCE_TIMEOUT_SECS,
            max_history: constants::DEFAULT_MAX_HISTORY,
            task_timeout_seconds: constants::DEFAULT_TASK_TIMEOUT_SECS,
            mq: MqConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            backend: MqBackend::Memory,
            max_queue_size: constants::DEFAULT_MAX_QUEUE_SIZE,
            stream_queue_size: constants::DEFAULT_STREAM_QUEUE_SIZE,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: constants::DEFAULT_API_HOST.to_string(),
            port: constants::DEFAULT_API_PORT,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from the environment, applying defaults for
    /// anything unset. Invalid values fail startup rather than being
    /// silently replaced.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("loaded .env file from {:?}", path),
            Err(_) => tracing::debug!("no .env file found, using process environment"),
        }

        let workers = parse_env("WORKERS", constants::DEFAULT_WORKERS)?;
        let cleanup_interval_seconds = parse_env(
            "CLEANUP_INTERVAL_SECONDS",
            constants::DEFAULT_CLEANUP_INTERVAL_SECS,
        )?;
        let instance_timeout_seconds = parse_env(
            "INSTANCE_TIMEOUT_SECONDS",
            constants::DEFAULT_INSTANCE_TIMEOUT_SECS,
        )?;
        let max_history: usize = parse_env("MAX_HISTORY", constants::DEFAULT_MAX_HISTORY)?;
        let task_timeout_seconds = parse_env(
            "TASK_DEFAULT_TIMEOUT_SECONDS",
            constants::DEFAULT_TASK_TIMEOUT_SECS,
        )?;

        let backend = match env::var("MQ_BACKEND") {
            Ok(value) => MqBackend::from_str(value.trim())
                .map_err(RuntimeError::Configuration)?,
            Err(_) => MqBackend::Memory,
        };
        let mq = MqConfig {
            backend,
            max_queue_size: parse_env("MQ_MAX_QUEUE_SIZE", constants::DEFAULT_MAX_QUEUE_SIZE)?,
            stream_queue_size: parse_env(
                "MQ_STREAM_QUEUE_SIZE",
                constants::DEFAULT_STREAM_QUEUE_SIZE,
            )?,
        };

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| ApiConfig::default().allowed_origins);

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| constants::DEFAULT_API_HOST.to_string()),
            port: parse_env("API_PORT", constants::DEFAULT_API_PORT)?,
            allowed_origins,
        };

        let config = Self {
            workers,
            cleanup_interval_seconds,
            instance_timeout_seconds,
            max_history,
            task_timeout_seconds,
            mq,
            api,
        };
        config.validate()
    }

    fn validate(mut self) -> Result<Self> {
        if self.workers == 0 {
            return Err(RuntimeError::Configuration(
                "WORKERS must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_seconds == 0 {
            return Err(RuntimeError::Configuration(
                "TASK_DEFAULT_TIMEOUT_SECONDS must be positive".to_string(),
            ));
        }
        if self.mq.max_queue_size == 0 || self.mq.stream_queue_size == 0 {
            return Err(RuntimeError::Configuration(
                "queue sizes must be positive".to_string(),
            ));
        }
        // MAX_HISTORY = 0 is pathological; the history floor wins.
        if self.max_history < constants::HISTORY_FLOOR {
            tracing::warn!(
                "MAX_HISTORY={} below floor, clamping to {}",
                self.max_history,
                constants::HISTORY_FLOOR
            );
            self.max_history = constants::HISTORY_FLOOR;
        }
        Ok(self)
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|e| {
            RuntimeError::Configuration(format!("invalid value for {key}: {e}"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests;
