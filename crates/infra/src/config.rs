//! Process configuration read from `FLEET_*` environment variables.
//!
//! Every setting has a default; only malformed values are errors.

use std::str::FromStr;
use std::time::Duration;

use crate::queue::QueueConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Interval and jitter of one periodic task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskTiming {
    pub interval: Duration,
    /// Fraction of `interval`, e.g. `0.25` for ±25%.
    pub jitter: f64,
}

impl TaskTiming {
    pub const fn new(interval_secs: u64, jitter: f64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            jitter,
        }
    }
}

/// Timings of the maintenance tasks the manager schedules.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerTimings {
    pub distribute: TaskTiming,
    pub health_check: TaskTiming,
    pub sync_workers: TaskTiming,
    pub rebalance: TaskTiming,
    pub hourly_reset: TaskTiming,
    /// How often the per-worker daily reset hour is checked.
    pub daily_reset_check: TaskTiming,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        Self {
            distribute: TaskTiming::new(35, 0.30),
            health_check: TaskTiming::new(60, 0.25),
            sync_workers: TaskTiming::new(15, 0.25),
            rebalance: TaskTiming::new(300, 0.25),
            hourly_reset: TaskTiming::new(3600, 0.25),
            daily_reset_check: TaskTiming::new(3600, 0.15),
        }
    }
}

/// TTLs of the distributed locks that serialize maintenance ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTtls {
    pub distribute: Duration,
    pub health_check: Duration,
    pub rebalance: Duration,
}

impl Default for LockTtls {
    fn default() -> Self {
        Self {
            distribute: Duration::from_secs(25),
            health_check: Duration::from_secs(55),
            rebalance: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    /// Redis connection string; in-memory backends are used when unset.
    pub redis_url: Option<String>,
    pub max_workers: usize,
    pub max_fails_before_swap: u32,
    pub timings: SchedulerTimings,
    pub locks: LockTtls,
    pub stagger_min: Duration,
    pub stagger_max: Duration,
    pub shutdown_timeout: Duration,
    pub worker_stop_timeout: Duration,
    /// Upper bound on opening one worker's client.
    pub connect_timeout: Duration,
    pub queue: QueueConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            max_workers: 100,
            max_fails_before_swap: fleet_core::MAX_FAILS_BEFORE_SWAP,
            timings: SchedulerTimings::default(),
            locks: LockTtls::default(),
            stagger_min: Duration::from_secs(3),
            stagger_max: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            worker_stop_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            queue: QueueConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let env = Env { lookup: &lookup };

        let timings = SchedulerTimings {
            distribute: env.timing("DISTRIBUTE", d.timings.distribute)?,
            health_check: env.timing("HEALTH_CHECK", d.timings.health_check)?,
            sync_workers: env.timing("SYNC_WORKERS", d.timings.sync_workers)?,
            rebalance: env.timing("REBALANCE", d.timings.rebalance)?,
            hourly_reset: env.timing("HOURLY_RESET", d.timings.hourly_reset)?,
            daily_reset_check: env.timing("DAILY_RESET", d.timings.daily_reset_check)?,
        };

        let locks = LockTtls {
            distribute: env.secs("FLEET_DISTRIBUTE_LOCK_TTL_SECS", d.locks.distribute)?,
            health_check: env.secs("FLEET_HEALTH_CHECK_LOCK_TTL_SECS", d.locks.health_check)?,
            rebalance: env.secs("FLEET_REBALANCE_LOCK_TTL_SECS", d.locks.rebalance)?,
        };

        let queue = QueueConfig {
            max_retries: env.parse("FLEET_QUEUE_MAX_RETRIES", d.queue.max_retries)?,
            retry_base_delay: env.secs("FLEET_QUEUE_RETRY_BASE_SECS", d.queue.retry_base_delay)?,
            dedup_ttl: env.secs("FLEET_QUEUE_DEDUP_TTL_SECS", d.queue.dedup_ttl)?,
            dead_letter_cap: env.parse("FLEET_QUEUE_DEAD_LETTER_CAP", d.queue.dead_letter_cap)?,
            poll_interval: env.millis("FLEET_QUEUE_POLL_INTERVAL_MS", d.queue.poll_interval)?,
        };

        let config = Self {
            redis_url: lookup("FLEET_REDIS_URL").filter(|v| !v.trim().is_empty()),
            max_workers: env.parse("FLEET_MAX_WORKERS", d.max_workers)?,
            max_fails_before_swap: env.parse("FLEET_MAX_FAILS_BEFORE_SWAP", d.max_fails_before_swap)?,
            timings,
            locks,
            stagger_min: env.secs("FLEET_STAGGER_MIN_SECS", d.stagger_min)?,
            stagger_max: env.secs("FLEET_STAGGER_MAX_SECS", d.stagger_max)?,
            shutdown_timeout: env.secs("FLEET_SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout)?,
            worker_stop_timeout: env.secs("FLEET_WORKER_STOP_TIMEOUT_SECS", d.worker_stop_timeout)?,
            connect_timeout: env.secs("FLEET_CONNECT_TIMEOUT_SECS", d.connect_timeout)?,
            queue,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fails_before_swap == 0 {
            return Err(invalid("FLEET_MAX_FAILS_BEFORE_SWAP", "0", "must be at least 1"));
        }
        if self.stagger_min > self.stagger_max {
            return Err(invalid(
                "FLEET_STAGGER_MIN_SECS",
                &self.stagger_min.as_secs().to_string(),
                "must not exceed FLEET_STAGGER_MAX_SECS",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn timing(&self, task: &str, default: TaskTiming) -> Result<TaskTiming, ConfigError> {
        let interval_key = format!("FLEET_{task}_INTERVAL_SECS");
        let jitter_key = format!("FLEET_{task}_JITTER");

        let interval = self.secs(&interval_key, default.interval)?;
        let jitter: f64 = self.parse(&jitter_key, default.jitter)?;
        if !(0.0..1.0).contains(&jitter) {
            return Err(invalid(&jitter_key, &jitter.to_string(), "must be in [0, 1)"));
        }
        if interval.is_zero() {
            return Err(invalid(&interval_key, "0", "must be positive"));
        }
        Ok(TaskTiming { interval, jitter })
    }
}
