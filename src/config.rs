use std::{env::var, str::FromStr, time::Duration};

use dotenvy::dotenv;
use thiserror::Error;

use crate::{
    application::services::scheduler::BackoffPolicy,
    infrastructure::scheduling::{PollingConfig, QueueSchedulerConfig, SchedulerMode},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name} env param: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub mode: SchedulerMode,
    pub queue: QueueSchedulerConfig,
    pub polling: PollingConfig,
    pub relay_url: Option<String>,
}

impl Config {
    pub fn try_parse() -> Result<Config, ConfigError> {
        let _ = dotenv();
        Self::from_lookup(|name| var(name).ok())
    }

    /// Builds the config from any variable source; unset or blank values
    /// take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mode = match get("SCHEDULER_MODE") {
            Some(value) => SchedulerMode::from_str(&value).ok_or(ConfigError::Invalid {
                name: "SCHEDULER_MODE",
                value,
            })?,
            None => SchedulerMode::default(),
        };

        let poll_interval =
            Duration::from_millis(positive(&get, "SCHEDULER_POLL_INTERVAL_MS", 1000)?);
        let shutdown_timeout =
            Duration::from_secs(parse(&get, "SCHEDULER_SHUTDOWN_TIMEOUT_SECS", 30)?);
        let lease_timeout =
            Duration::from_secs(positive(&get, "SCHEDULER_LEASE_TIMEOUT_SECS", 300)?);

        let backoff = BackoffPolicy {
            base: Duration::from_secs(parse(&get, "SCHEDULER_BACKOFF_BASE_SECS", 300)?),
            factor: parse(&get, "SCHEDULER_BACKOFF_FACTOR", 3)?,
            max_delay: parse_optional(&get, "SCHEDULER_BACKOFF_MAX_SECS")?
                .map(Duration::from_secs),
            max_attempts: parse(&get, "SCHEDULER_MAX_ATTEMPTS", 5)?,
        };

        Ok(Config {
            database_url: get("DATABASE_URL"),
            mode,
            queue: QueueSchedulerConfig {
                queue: get("SCHEDULER_QUEUE").unwrap_or_else(|| "default".to_string()),
                workers: positive(&get, "SCHEDULER_WORKERS", 10)?,
                poll_interval,
                lease_timeout,
                shutdown_timeout,
                backoff,
            },
            polling: PollingConfig {
                poll_interval,
                batch_size: positive(&get, "SCHEDULER_BATCH_SIZE", 100)?,
                max_concurrent: positive(&get, "SCHEDULER_CONCURRENCY", 4)?,
                shutdown_timeout,
            },
            relay_url: get("DELIVERY_RELAY_URL"),
        })
    }
}

fn parse_optional<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { name, value })
        })
        .transpose()
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_optional(get, name)?.unwrap_or(default))
}

fn positive<T: FromStr + PartialOrd + Default>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse(get, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: get(name).unwrap_or_default(),
        });
    }
    Ok(value)
}
