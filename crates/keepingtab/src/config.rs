//! Service configuration.
//!
//! [`ServiceConfig`] collects every tunable of the service in one place and
//! derives the component configs from it. It can be built from defaults,
//! from `KEEPINGTAB_*` environment variables, or from JSON.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keepingtab_core::ConsumerId;
use keepingtab_sync::{
    BackoffPolicy, CoordinatorConfig, QueueConfig, ReaperConfig, WorkerConfig,
};

use crate::error::ConfigError;

/// Prefix shared by all recognized environment variables.
pub const ENV_PREFIX: &str = "KEEPINGTAB_";

/// Default database location.
pub const DEFAULT_DATABASE_PATH: &str = "./data/keepingtab.db";

/// Jitter applied to every backoff schedule.
const BACKOFF_JITTER: f64 = 0.2;

/// Configuration for the sync service.
///
/// Durations are written in milliseconds (`*_ms`) or seconds (`*_secs`)
/// when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Identity the queue cursors are stored under.
    pub consumer_id: String,
    /// Number of queue partitions (one worker each).
    pub partition_count: u32,
    /// Settled events between cursor writes.
    pub batch_size: usize,
    /// In-place retries of a failing store write.
    pub retry_budget: u32,
    /// First store retry delay.
    #[serde(rename = "backoff_base_ms", with = "millis")]
    pub backoff_base: Duration,
    /// Longest store retry delay.
    #[serde(rename = "backoff_max_ms", with = "millis")]
    pub backoff_max: Duration,
    /// Longest delay between attempts to reach the queue.
    #[serde(rename = "queue_backoff_max_ms", with = "millis")]
    pub queue_backoff_max: Duration,
    /// Deliveries of one event before it is dead-lettered.
    pub max_deliveries: u32,
    /// First redelivery delay.
    #[serde(rename = "redelivery_backoff_ms", with = "millis")]
    pub redelivery_backoff: Duration,
    /// How long tombstones are kept.
    #[serde(rename = "tombstone_retention_secs", with = "secs")]
    pub tombstone_retention: Duration,
    /// Time between tombstone purges.
    #[serde(rename = "reaper_interval_secs", with = "secs")]
    pub reaper_interval: Duration,
    /// Worker panics tolerated per partition.
    pub max_restarts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            consumer_id: ConsumerId::default().as_str().to_string(),
            partition_count: 4,
            batch_size: 50,
            retry_budget: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            queue_backoff_max: Duration::from_secs(30),
            max_deliveries: 5,
            redelivery_backoff: Duration::from_millis(200),
            tombstone_retention: Duration::from_secs(7 * 24 * 60 * 60),
            reaper_interval: Duration::from_secs(60 * 60),
            max_restarts: 5,
        }
    }
}

impl ServiceConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Build from `(name, value)` pairs, on top of the defaults.
    ///
    /// Variables without the `KEEPINGTAB_` prefix are ignored. Prefixed
    /// variables that are not recognized are an error, so a typo cannot
    /// silently fall back to a default.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (name, value) in vars {
            let name = name.as_ref();
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();

            match key {
                "DB_PATH" => config.database_path = PathBuf::from(value),
                "CONSUMER_ID" => config.consumer_id = value.to_string(),
                "PARTITIONS" => config.partition_count = parse(name, value)?,
                "BATCH_SIZE" => config.batch_size = parse(name, value)?,
                "RETRY_BUDGET" => config.retry_budget = parse(name, value)?,
                "BACKOFF_BASE_MS" => config.backoff_base = Duration::from_millis(parse(name, value)?),
                "BACKOFF_MAX_MS" => config.backoff_max = Duration::from_millis(parse(name, value)?),
                "QUEUE_BACKOFF_MAX_MS" => {
                    config.queue_backoff_max = Duration::from_millis(parse(name, value)?)
                }
                "MAX_DELIVERIES" => config.max_deliveries = parse(name, value)?,
                "REDELIVERY_BACKOFF_MS" => {
                    config.redelivery_backoff = Duration::from_millis(parse(name, value)?)
                }
                "TOMBSTONE_RETENTION_SECS" => {
                    config.tombstone_retention = Duration::from_secs(parse(name, value)?)
                }
                "REAPER_INTERVAL_SECS" => {
                    config.reaper_interval = Duration::from_secs(parse(name, value)?)
                }
                "MAX_RESTARTS" => config.max_restarts = parse(name, value)?,
                _ => return Err(ConfigError::UnknownVariable(name.to_string())),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Build from a JSON object. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that would make the service unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_count == 0 {
            return Err(invalid("partition_count", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.max_deliveries == 0 {
            return Err(invalid("max_deliveries", "must be at least 1"));
        }
        if self.consumer_id.trim().is_empty() {
            return Err(invalid("consumer_id", "must not be empty"));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(invalid("database_path", "must not be empty"));
        }
        if self.backoff_base.is_zero() {
            return Err(invalid("backoff_base", "must be positive"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(invalid("backoff_max", "must not be below backoff_base"));
        }
        if self.queue_backoff_max < self.backoff_base {
            return Err(invalid("queue_backoff_max", "must not be below backoff_base"));
        }
        if self.reaper_interval.is_zero() {
            return Err(invalid("reaper_interval", "must be positive"));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Component Configs
    // ─────────────────────────────────────────────────────────────────────────

    /// Backoff between store retries.
    pub fn store_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max).with_jitter(BACKOFF_JITTER)
    }

    /// Backoff while the queue is unreachable.
    pub fn queue_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.queue_backoff_max).with_jitter(BACKOFF_JITTER)
    }

    /// Settings for each partition's coordinator.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            consumer: ConsumerId::new(self.consumer_id.clone()),
            batch_size: self.batch_size,
            retry_budget: self.retry_budget,
            store_backoff: self.store_backoff(),
            queue_backoff: self.queue_backoff(),
        }
    }

    /// Settings for the worker pool.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            coordinator: self.coordinator_config(),
            max_restarts: self.max_restarts,
        }
    }

    /// Redelivery settings for a queue built by this service.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_deliveries: self.max_deliveries,
            redelivery_backoff: BackoffPolicy::new(self.redelivery_backoff, self.backoff_max)
                .with_jitter(BACKOFF_JITTER),
        }
    }

    /// Settings for the tombstone reaper.
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            retention: self.tombstone_retention,
            interval: self.reaper_interval,
        }
    }
}

fn parse<T: std::str::FromStr>(variable: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        variable: variable.to_string(),
        value: value.to_string(),
    })
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
