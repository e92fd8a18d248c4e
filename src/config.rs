//! Configuration types.
//!
//! Everything is read from environment variables. Parsing goes through
//! `RelayConfig::from_lookup` so tests can supply a map instead of touching
//! the process environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::monitor::MonitorConfig;
use crate::pipeline::{RetryPolicy, WorkerConfig};
use crate::rate_limit::RateLimitConfig;
use crate::transport::ChatId;

/// Telegram Bot API settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Chat that receives operator alerts. Alerts are only logged when unset.
    pub admin_chat: Option<ChatId>,
    pub api_base: String,
    /// Long-poll timeout passed to `getUpdates`.
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: SecretString::from(""),
            admin_chat: None,
            api_base: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 30,
        }
    }
}

/// Forwarding queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 500 }
    }
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub telegram: TelegramConfig,
    pub database_path: PathBuf,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
    /// How long a critical-pressure shutdown waits for the queue to drain.
    pub drain_timeout: Duration,
    /// Port for the health/status HTTP surface. Disabled when unset.
    pub health_port: Option<u16>,
    /// Daily-rolling log file, in addition to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            database_path: PathBuf::from("data/relay.db"),
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            monitor: MonitorConfig::default(),
            drain_timeout: Duration::from_secs(30),
            health_port: None,
            log_file: None,
        }
    }
}

impl RelayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys take their defaults;
    /// only `TELEGRAM_BOT_TOKEN` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = Self::default();

        let bot_token = env
            .get("TELEGRAM_BOT_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let telegram = TelegramConfig {
            bot_token: SecretString::from(bot_token),
            admin_chat: env.parse_opt("RELAY_ADMIN_CHAT_ID")?,
            api_base: env
                .get("TELEGRAM_API_BASE")
                .unwrap_or(defaults.telegram.api_base),
            poll_timeout_secs: env.parse_or(
                "TELEGRAM_POLL_TIMEOUT_SECS",
                defaults.telegram.poll_timeout_secs,
            )?,
        };

        let queue = QueueConfig {
            capacity: env.parse_or("RELAY_QUEUE_CAPACITY", defaults.queue.capacity)?,
        };

        let workers = WorkerConfig {
            workers: env.parse_or("RELAY_WORKERS", defaults.workers.workers)?,
            ..defaults.workers
        };

        let rate_limit = RateLimitConfig {
            window: env.secs_or("RELAY_RATE_WINDOW_SECS", defaults.rate_limit.window)?,
            global_limit: env.parse_or("RELAY_GLOBAL_LIMIT", defaults.rate_limit.global_limit)?,
            destination_limit: env.parse_or(
                "RELAY_DESTINATION_LIMIT",
                defaults.rate_limit.destination_limit,
            )?,
        };

        let retry = RetryPolicy {
            max_attempts: env.parse_or("RELAY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: env
                .parse_opt::<u64>("RELAY_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_flood_sleep: env.secs_or(
                "RELAY_MAX_FLOOD_SLEEP_SECS",
                defaults.retry.max_flood_sleep,
            )?,
            ..defaults.retry
        };

        let monitor = MonitorConfig {
            interval: env.secs_or("RELAY_MONITOR_INTERVAL_SECS", defaults.monitor.interval)?,
            memory_warning_mb: env.parse_or(
                "RELAY_MEMORY_WARNING_MB",
                defaults.monitor.memory_warning_mb,
            )?,
            memory_critical_mb: env.parse_or(
                "RELAY_MEMORY_CRITICAL_MB",
                defaults.monitor.memory_critical_mb,
            )?,
            cpu_warning_pct: env.parse_or("RELAY_CPU_WARNING_PCT", defaults.monitor.cpu_warning_pct)?,
            cpu_critical_pct: env.parse_or(
                "RELAY_CPU_CRITICAL_PCT",
                defaults.monitor.cpu_critical_pct,
            )?,
            warning_cooldown: env.secs_or(
                "RELAY_WARNING_COOLDOWN_SECS",
                defaults.monitor.warning_cooldown,
            )?,
            stats_retention_days: env.parse_or(
                "RELAY_STATS_RETENTION_DAYS",
                defaults.monitor.stats_retention_days,
            )?,
            ..defaults.monitor
        };

        let config = Self {
            telegram,
            database_path: env
                .get("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            queue,
            workers,
            rate_limit,
            retry,
            monitor,
            drain_timeout: env.secs_or("RELAY_DRAIN_TIMEOUT_SECS", defaults.drain_timeout)?,
            health_port: env.parse_opt("RELAY_HEALTH_PORT")?,
            log_file: env.get("RELAY_LOG_FILE").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("RELAY_QUEUE_CAPACITY", self.queue.capacity),
            ("RELAY_WORKERS", self.workers.workers),
            ("RELAY_GLOBAL_LIMIT", self.rate_limit.global_limit),
            ("RELAY_DESTINATION_LIMIT", self.rate_limit.destination_limit),
            ("RELAY_MAX_ATTEMPTS", self.retry.max_attempts as usize),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "must be at least 1"));
            }
        }

        if self.rate_limit.window.is_zero() {
            return Err(invalid("RELAY_RATE_WINDOW_SECS", "must be at least 1"));
        }
        if self.monitor.interval.is_zero() {
            return Err(invalid("RELAY_MONITOR_INTERVAL_SECS", "must be at least 1"));
        }
        if self.monitor.memory_warning_mb >= self.monitor.memory_critical_mb {
            return Err(invalid(
                "RELAY_MEMORY_WARNING_MB",
                "must be below RELAY_MEMORY_CRITICAL_MB",
            ));
        }
        if self.monitor.cpu_warning_pct >= self.monitor.cpu_critical_pct {
            return Err(invalid(
                "RELAY_CPU_WARNING_PCT",
                "must be below RELAY_CPU_CRITICAL_PCT",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Typed accessors over a key lookup. Blank values count as unset.
struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| invalid(key, format!("{raw:?}: {e}")))
            })
            .transpose()
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }
}
