//! Runtime configuration for the messaging pipeline.
//!
//! Plain structs with `Default` values; `MessagingConfig::from_env()` overlays
//! `TAXFLOW_*` environment variables on top of the defaults.

use std::time::Duration;

use crate::retry::policy::BackoffPolicy;

pub const DEFAULT_MAIN_TOPIC: &str = "person.events";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// How a batch fans out across keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyParallelism {
    /// One key after the other on the consuming thread.
    Sequential,
    /// Up to `max_workers` keys at once, joined before acknowledgment.
    Parallel { max_workers: usize },
}

impl KeyParallelism {
    pub fn from_workers(workers: usize) -> Self {
        if workers <= 1 {
            Self::Sequential
        } else {
            Self::Parallel {
                max_workers: workers,
            }
        }
    }
}

/// Retry chain settings shared by the router, engine and retry workers.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Number of retry stages (`retry-1 ..= retry-N`).
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// TTL for state flags, buffers and signal channels.
    pub state_ttl: Duration,
    /// How long a batch worker blocks on the latch.
    pub wait_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            state_ttl: Duration::from_secs(3600),
            wait_timeout: Duration::from_secs(60),
        }
    }
}

/// Consumer polling settings.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_records: usize,
    pub poll_timeout: Duration,
    pub key_parallelism: KeyParallelism,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_records: 500,
            poll_timeout: Duration::from_millis(1000),
            key_parallelism: KeyParallelism::Sequential,
        }
    }
}

/// Dead-letter recovery loop settings.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub interval: Duration,
    pub max_attempts: u32,
    pub poll_timeout: Duration,
    pub group: String,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_attempts: 3,
            poll_timeout: Duration::from_secs(10),
            group: "person.dlt.recovery.group".to_string(),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub main_topic: String,
    pub retry: RetrySettings,
    pub consumer: ConsumerSettings,
    pub recovery: RecoverySettings,
    pub redis_url: String,
    pub database_url: Option<String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            main_topic: DEFAULT_MAIN_TOPIC.to_string(),
            retry: RetrySettings::default(),
            consumer: ConsumerSettings::default(),
            recovery: RecoverySettings::default(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            database_url: None,
        }
    }
}

impl MessagingConfig {
    pub fn with_main_topic(mut self, topic: impl Into<String>) -> Self {
        self.main_topic = topic.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.retry.wait_timeout = timeout;
        self
    }

    pub fn with_key_parallelism(mut self, parallelism: KeyParallelism) -> Self {
        self.consumer.key_parallelism = parallelism;
        self
    }

    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.recovery.max_attempts = attempts;
        self
    }

    /// `{main}.retry-{stage}`
    pub fn retry_topic(&self, stage: u32) -> String {
        format!("{}.retry-{stage}", self.main_topic)
    }

    /// `{main}.dlt`
    pub fn dlt_topic(&self) -> String {
        format!("{}.dlt", self.main_topic)
    }

    pub fn main_group(&self) -> String {
        format!("{}.group", self.main_topic)
    }

    pub fn retry_group(&self, stage: u32) -> String {
        format!("{}.retry-{stage}.group", self.main_topic)
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup (unset variables keep defaults).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(topic) = lookup("TAXFLOW_MAIN_TOPIC") {
            if topic.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    name: "TAXFLOW_MAIN_TOPIC",
                    value: topic,
                });
            }
            cfg.main_topic = topic.trim().to_string();
        }

        if let Some(v) = parse::<u32>(&lookup, "TAXFLOW_MAX_RETRIES")? {
            cfg.retry.max_retries = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "TAXFLOW_RETRY_BASE_DELAY_MS")? {
            cfg.retry.backoff.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TAXFLOW_RETRY_MAX_DELAY_MS")? {
            cfg.retry.backoff.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TAXFLOW_STATE_TTL_SECS")? {
            cfg.retry.state_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TAXFLOW_WAIT_TIMEOUT_SECS")? {
            cfg.retry.wait_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse::<usize>(&lookup, "TAXFLOW_BATCH_MAX_RECORDS")? {
            cfg.consumer.max_records = v.max(1);
        }
        if let Some(v) = parse::<u64>(&lookup, "TAXFLOW_POLL_TIMEOUT_MS")? {
            cfg.consumer.poll_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<usize>(&lookup, "TAXFLOW_KEY_WORKERS")? {
            cfg.consumer.key_parallelism = KeyParallelism::from_workers(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TAXFLOW_RECOVERY_INTERVAL_SECS")? {
            cfg.recovery.interval = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u32>(&lookup, "TAXFLOW_MAX_RECOVERY_ATTEMPTS")? {
            cfg.recovery.max_attempts = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "TAXFLOW_RECOVERY_POLL_SECS")? {
            cfg.recovery.poll_timeout = Duration::from_secs(v);
        }

        if let Some(url) = lookup("REDIS_URL") {
            cfg.redis_url = url;
        }
        cfg.database_url = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty());

        Ok(cfg)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
