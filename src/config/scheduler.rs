//! Scheduler and watchdog configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{SchedulerError, SchedulerResult};

const ENV_PREFIX: &str = "SLOT_SCHEDULER_";

/// Deadlock watchdog configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Whether a watchdog is started with the scheduler.
    pub enabled: bool,
    /// Sampling period in milliseconds.
    pub period_ms: u64,
    /// Consecutive blocked samples that count as a deadlock.
    pub blocked_threshold: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 1_000,
            blocked_threshold: 5,
        }
    }
}

impl WatchdogConfig {
    /// Sampling period as a `Duration`.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Validate watchdog values.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` for a zero period or threshold on an
    /// enabled watchdog.
    pub fn validate(&self) -> SchedulerResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.period_ms == 0 {
            return Err(SchedulerError::invalid("period_ms", "must be greater than 0"));
        }
        if self.blocked_threshold == 0 {
            return Err(SchedulerError::invalid(
                "blocked_threshold",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of execution slots.
    pub max_concurrency: usize,
    /// Whether urgent work displaces less urgent running work.
    pub preemptive: bool,
    /// Whether placement runs after every submission and completion.
    pub realtime: bool,
    /// Time limit inherited by tasks scheduled without their own, in milliseconds.
    pub global_time_limit_ms: Option<u64>,
    /// Deadlock watchdog settings.
    pub watchdog: WatchdogConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
            preemptive: false,
            realtime: true,
            global_time_limit_ms: None,
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of execution slots.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Enable or disable preemption.
    #[must_use]
    pub const fn with_preemptive(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }

    /// Enable or disable realtime placement.
    #[must_use]
    pub const fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Set the inherited time limit. `None` disables it.
    ///
    /// The configuration stores whole milliseconds; a fractional limit is rounded up so
    /// that a positive limit never becomes zero. Use
    /// [`SchedulerBuilder::global_time_limit`](crate::builders::SchedulerBuilder::global_time_limit)
    /// for sub-millisecond precision.
    #[must_use]
    pub fn with_global_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.global_time_limit_ms = limit.map(|d| {
            u64::try_from(d.as_micros().div_ceil(1_000)).unwrap_or(u64::MAX)
        });
        self
    }

    /// Replace the watchdog settings.
    #[must_use]
    pub const fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Inherited time limit as a `Duration`.
    #[must_use]
    pub fn global_time_limit(&self) -> Option<Duration> {
        self.global_time_limit_ms.map(Duration::from_millis)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` when there are no slots, when the
    /// global time limit is zero, or when the watchdog settings are invalid.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_concurrency == 0 {
            return Err(SchedulerError::invalid(
                "max_concurrency",
                "the scheduler needs at least one slot",
            ));
        }
        if self.global_time_limit_ms == Some(0) {
            return Err(SchedulerError::invalid(
                "global_time_limit",
                "must be greater than 0 when set",
            ));
        }
        self.watchdog.validate()
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` on malformed JSON and the validation
    /// error otherwise.
    pub fn from_json_str(input: &str) -> SchedulerResult<Self> {
        let cfg: Self = serde_json::from_str(input)
            .map_err(|e| SchedulerError::InvalidConfig(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `SLOT_SCHEDULER_*` environment variables, loading a
    /// `.env` file first when one exists. Unset variables keep their defaults.
    ///
    /// Recognised: `MAX_CONCURRENCY`, `PREEMPTIVE`, `REALTIME`, `GLOBAL_TIME_LIMIT_MS`,
    /// `WATCHDOG_ENABLED`, `WATCHDOG_PERIOD_MS`, `WATCHDOG_THRESHOLD`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for unparsable values and the validation
    /// error otherwise.
    pub fn from_env() -> SchedulerResult<Self> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SchedulerResult<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> SchedulerResult<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim().parse().map_err(|e| {
                SchedulerError::InvalidConfig(format!("{ENV_PREFIX}{key}={raw}: {e}"))
            })
        }

        let mut cfg = Self::default();
        if let Some(raw) = lookup("MAX_CONCURRENCY") {
            cfg.max_concurrency = parse("MAX_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = lookup("PREEMPTIVE") {
            cfg.preemptive = parse("PREEMPTIVE", &raw)?;
        }
        if let Some(raw) = lookup("REALTIME") {
            cfg.realtime = parse("REALTIME", &raw)?;
        }
        if let Some(raw) = lookup("GLOBAL_TIME_LIMIT_MS") {
            cfg.global_time_limit_ms = Some(parse("GLOBAL_TIME_LIMIT_MS", &raw)?);
        }
        if let Some(raw) = lookup("WATCHDOG_ENABLED") {
            cfg.watchdog.enabled = parse("WATCHDOG_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("WATCHDOG_PERIOD_MS") {
            cfg.watchdog.period_ms = parse("WATCHDOG_PERIOD_MS", &raw)?;
        }
        if let Some(raw) = lookup("WATCHDOG_THRESHOLD") {
            cfg.watchdog.blocked_threshold = parse("WATCHDOG_THRESHOLD", &raw)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
