//! Builder assembling a scheduler from configuration and pluggable parts.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::core::{terminate_process, DeadlockAction, Scheduler, SchedulerResult, Spawn};
use crate::runtime::ThreadSpawner;

/// Collects the execution backend and deadlock action for a [`Scheduler`].
///
/// Unset parts fall back to a [`ThreadSpawner`] and to [`terminate_process`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    spawner: Option<Arc<dyn Spawn>>,
    on_deadlock: Option<DeadlockAction>,
    global_time_limit: Option<Duration>,
}

impl SchedulerBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            spawner: None,
            on_deadlock: None,
            global_time_limit: None,
        }
    }

    /// Run task bodies, timeout watchers and the watchdog on `spawner`.
    #[must_use]
    pub fn spawner(mut self, spawner: impl Spawn + 'static) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    /// Replace the action taken when the watchdog declares a deadlock.
    #[must_use]
    pub fn on_deadlock(mut self, action: DeadlockAction) -> Self {
        self.on_deadlock = Some(action);
        self
    }

    /// Inherited time limit with full `Duration` precision, overriding
    /// `global_time_limit_ms` from the configuration.
    #[must_use]
    pub fn global_time_limit(mut self, limit: Duration) -> Self {
        self.global_time_limit = Some(limit);
        self
    }

    /// Validate the configuration and start the scheduler (and its watchdog).
    ///
    /// # Errors
    ///
    /// Returns the validation error for an invalid configuration, or
    /// `SchedulerError::Spawn` when the watchdog loop cannot be started.
    pub fn build(self) -> SchedulerResult<Scheduler> {
        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(ThreadSpawner::new()));
        let on_deadlock = self.on_deadlock.unwrap_or_else(terminate_process);
        let global_time_limit = self
            .global_time_limit
            .or_else(|| self.config.global_time_limit());
        Scheduler::from_parts(&self.config, global_time_limit, spawner, on_deadlock)
    }
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("custom_spawner", &self.spawner.is_some())
            .field("custom_deadlock_action", &self.on_deadlock.is_some())
            .field("global_time_limit", &self.global_time_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::core::{SchedulerError, WatchdogState};

    #[test]
    fn test_invalid_config_rejected() {
        let err = SchedulerBuilder::new(SchedulerConfig::new().with_max_concurrency(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidArgument { argument: "max_concurrency", .. }));
    }

    #[test]
    fn test_sub_millisecond_limit_is_kept() {
        let scheduler = SchedulerBuilder::new(SchedulerConfig::new().with_max_concurrency(1))
            .global_time_limit(Duration::from_micros(1_500))
            .on_deadlock(Arc::new(|_: &crate::core::DeadlockReport| {}))
            .build()
            .unwrap();
        assert_eq!(scheduler.global_time_limit(), Some(Duration::from_micros(1_500)));
    }

    #[test]
    fn test_zero_limit_override_rejected() {
        let err = SchedulerBuilder::new(SchedulerConfig::new().with_max_concurrency(1))
            .global_time_limit(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidArgument { argument: "global_time_limit", .. }));
    }

    #[test]
    fn test_disabled_watchdog_is_absent() {
        let scheduler = SchedulerBuilder::new(
            SchedulerConfig::new()
                .with_max_concurrency(2)
                .with_watchdog(WatchdogConfig {
                    enabled: false,
                    ..WatchdogConfig::default()
                }),
        )
        .build()
        .unwrap();
        assert_eq!(scheduler.watchdog_state(), None);
        assert_eq!(scheduler.max_task_count(), 2);
    }

    #[test]
    fn test_watchdog_stops_on_shutdown() {
        let scheduler = SchedulerBuilder::new(
            SchedulerConfig::new()
                .with_max_concurrency(1)
                .with_watchdog(WatchdogConfig {
                    period_ms: 10,
                    ..WatchdogConfig::default()
                }),
        )
        .spawner(ThreadSpawner::new())
        .build()
        .unwrap();
        scheduler.shutdown();
        assert_eq!(scheduler.watchdog_state(), Some(WatchdogState::Stopped));
    }
}
