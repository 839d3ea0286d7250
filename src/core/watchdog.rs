//! Background detection of resource-contention stalls.
//!
//! Every period the watchdog samples the held/wanted resource names of all running and
//! paused tasks. A running task is *blocked* when it wants a name that another running
//! task or any paused task holds. Short-lived contention is normal, so a verdict is only
//! reached after `threshold` consecutive samples contain at least one blocked task. The
//! verdict is unrecoverable: threads parked inside arbitrary mutators cannot be unwound,
//! so the default action terminates the process.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use super::resource_store::ClaimSnapshot;
use super::task_handle::TaskId;
use super::{SchedulerError, SchedulerResult, Spawn};
use crate::util::now_ms;

/// Exit status used when the default action terminates the process.
pub const DEADLOCK_EXIT_CODE: i32 = -1;

/// Lifecycle of the watchdog loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Created, loop not requested yet.
    NotStarted,
    /// Loop requested, not yet running.
    Starting,
    /// Sampling.
    Running,
    /// Stop requested, loop has not observed it yet.
    Stopping,
    /// Loop exited. Terminal.
    Stopped,
}

/// Claims of one task inside a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskClaims {
    /// Task identifier.
    pub id: TaskId,
    /// Held/wanted names at sampling time.
    pub claims: ClaimSnapshot,
}

/// Point-in-time view of every active task's claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentionSample {
    /// Tasks occupying a slot.
    pub running: Vec<TaskClaims>,
    /// Tasks preempted and parked.
    pub paused: Vec<TaskClaims>,
}

impl ContentionSample {
    /// Running tasks that want a name held by another running task or by a paused task.
    #[must_use]
    pub fn blocked_tasks(&self) -> Vec<TaskId> {
        let held_by_paused: BTreeSet<&str> = self
            .paused
            .iter()
            .flat_map(|t| t.claims.held.iter().map(String::as_str))
            .collect();

        self.running
            .iter()
            .filter(|current| {
                current.claims.wanted.iter().any(|name| {
                    held_by_paused.contains(name.as_str())
                        || self
                            .running
                            .iter()
                            .any(|other| other.id != current.id && other.claims.held.contains(name))
                })
            })
            .map(|t| t.id)
            .collect()
    }
}

/// What the watchdog saw when it declared a deadlock.
#[derive(Debug, Clone)]
pub struct DeadlockReport {
    /// Consecutive blocked samples observed.
    pub blocked_samples: u32,
    /// Running tasks blocked in the final sample.
    pub blocked_tasks: Vec<TaskId>,
    /// The final sample.
    pub sample: ContentionSample,
    /// Wall-clock time of the verdict, milliseconds since the Unix epoch.
    pub detected_at_ms: u128,
}

/// Action run on a deadlock verdict.
pub type DeadlockAction = Arc<dyn Fn(&DeadlockReport) + Send + Sync>;

/// Produces a sample, or `None` once the observed scheduler is gone.
pub type ContentionSampler = Arc<dyn Fn() -> Option<ContentionSample> + Send + Sync>;

/// The default action: exit the process with [`DEADLOCK_EXIT_CODE`].
#[must_use]
pub fn terminate_process() -> DeadlockAction {
    Arc::new(|report: &DeadlockReport| {
        error!(
            blocked_samples = report.blocked_samples,
            blocked_tasks = ?report.blocked_tasks,
            "all progress blocked on shared resources, terminating process"
        );
        std::process::exit(DEADLOCK_EXIT_CODE);
    })
}

struct Shared {
    state: Mutex<WatchdogState>,
    changed: Condvar,
}

impl Shared {
    fn set(&self, state: WatchdogState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

/// Periodic contention sampler bound to one scheduler.
pub struct DeadlockWatchdog {
    shared: Arc<Shared>,
    period: Duration,
    threshold: u32,
    sampler: ContentionSampler,
    action: DeadlockAction,
}

impl DeadlockWatchdog {
    /// Create a watchdog in the `NotStarted` state.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` for a zero period or zero threshold.
    pub fn new(
        period: Duration,
        threshold: u32,
        sampler: ContentionSampler,
        action: DeadlockAction,
    ) -> SchedulerResult<Self> {
        if period.is_zero() {
            return Err(SchedulerError::invalid("period", "must be greater than 0"));
        }
        if threshold == 0 {
            return Err(SchedulerError::invalid("threshold", "must be greater than 0"));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WatchdogState::NotStarted),
                changed: Condvar::new(),
            }),
            period,
            threshold,
            sampler,
            action,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WatchdogState {
        *self.shared.state.lock()
    }

    /// Start the sampling loop on `spawner`. Only the first call has an effect.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Spawn` if the loop could not be started; the watchdog is
    /// then `Stopped`.
    pub fn start(&self, spawner: &dyn Spawn) -> SchedulerResult<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != WatchdogState::NotStarted {
                return Ok(());
            }
            *state = WatchdogState::Starting;
        }

        let shared = Arc::clone(&self.shared);
        let sampler = Arc::clone(&self.sampler);
        let action = Arc::clone(&self.action);
        let (period, threshold) = (self.period, self.threshold);
        let job = Box::new(move || run_loop(&shared, period, threshold, &*sampler, &*action));

        spawner
            .spawn("deadlock-watchdog".into(), job)
            .inspect_err(|e| {
                error!(error = %e, "failed to start deadlock watchdog");
                self.shared.set(WatchdogState::Stopped);
            })
    }

    /// Request the loop to stop and wait until it has.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        match *state {
            WatchdogState::Stopped => return,
            WatchdogState::NotStarted => {
                *state = WatchdogState::Stopped;
                return;
            }
            WatchdogState::Starting | WatchdogState::Running => {
                *state = WatchdogState::Stopping;
                self.shared.changed.notify_all();
            }
            WatchdogState::Stopping => {}
        }
        self.shared
            .changed
            .wait_while(&mut state, |s| *s != WatchdogState::Stopped);
    }
}

impl fmt::Debug for DeadlockWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockWatchdog")
            .field("state", &self.state())
            .field("period", &self.period)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

fn run_loop(
    shared: &Shared,
    period: Duration,
    threshold: u32,
    sampler: &(dyn Fn() -> Option<ContentionSample> + Send + Sync),
    action: &(dyn Fn(&DeadlockReport) + Send + Sync),
) {
    {
        let mut state = shared.state.lock();
        if *state == WatchdogState::Starting {
            *state = WatchdogState::Running;
            info!(?period, threshold, "deadlock watchdog running");
        }
    }

    let mut blocked_samples = 0u32;
    loop {
        if *shared.state.lock() != WatchdogState::Running {
            break;
        }

        let Some(sample) = sampler() else {
            debug!("scheduler gone, watchdog exiting");
            break;
        };
        let blocked_tasks = sample.blocked_tasks();
        if blocked_tasks.is_empty() {
            blocked_samples = 0;
        } else {
            blocked_samples += 1;
            debug!(blocked_samples, blocked_tasks = ?blocked_tasks, "resource contention sampled");
        }

        if blocked_samples >= threshold {
            let report = DeadlockReport {
                blocked_samples,
                blocked_tasks,
                sample,
                detected_at_ms: now_ms(),
            };
            error!(blocked_samples, "deadlock detected");
            action(&report);
            blocked_samples = 0;
        }

        let mut state = shared.state.lock();
        shared
            .changed
            .wait_while_for(&mut state, |s| *s == WatchdogState::Running, period);
    }

    shared.set(WatchdogState::Stopped);
    info!("deadlock watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ThreadSpawner;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn claims(id: TaskId, held: &[&str], wanted: &[&str]) -> TaskClaims {
        TaskClaims {
            id,
            claims: ClaimSnapshot {
                held: held.iter().map(|s| (*s).to_owned()).collect(),
                wanted: wanted.iter().map(|s| (*s).to_owned()).collect(),
            },
        }
    }

    #[test]
    fn test_crossed_lock_order_is_blocked() {
        let sample = ContentionSample {
            running: vec![claims(1, &["a"], &["b"]), claims(2, &["b"], &["a"])],
            paused: vec![],
        };
        assert_eq!(sample.blocked_tasks(), vec![1, 2]);
    }

    #[test]
    fn test_own_holdings_do_not_block() {
        let sample = ContentionSample {
            running: vec![claims(1, &["a"], &["a"]), claims(2, &[], &[])],
            paused: vec![],
        };
        assert!(sample.blocked_tasks().is_empty());
    }

    #[test]
    fn test_paused_holder_blocks_running_waiter() {
        let sample = ContentionSample {
            running: vec![claims(1, &[], &["y"])],
            paused: vec![claims(2, &["y"], &[])],
        };
        assert_eq!(sample.blocked_tasks(), vec![1]);
    }

    #[test]
    fn test_paused_waiters_are_not_reported() {
        let sample = ContentionSample {
            running: vec![claims(1, &["y"], &[])],
            paused: vec![claims(2, &[], &["y"])],
        };
        assert!(sample.blocked_tasks().is_empty());
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let sampler: ContentionSampler = Arc::new(|| Some(ContentionSample::default()));
        let action: DeadlockAction = Arc::new(|_: &DeadlockReport| {});
        assert!(DeadlockWatchdog::new(Duration::ZERO, 1, Arc::clone(&sampler), Arc::clone(&action)).is_err());
        assert!(DeadlockWatchdog::new(Duration::from_millis(1), 0, sampler, action).is_err());
    }

    #[test]
    fn test_stop_before_start() {
        let watchdog = DeadlockWatchdog::new(
            Duration::from_millis(10),
            1,
            Arc::new(|| -> Option<ContentionSample> { None }),
            Arc::new(|_: &DeadlockReport| {}),
        )
        .unwrap();
        assert_eq!(watchdog.state(), WatchdogState::NotStarted);
        watchdog.stop();
        assert_eq!(watchdog.state(), WatchdogState::Stopped);
    }

    #[test]
    fn test_verdict_after_threshold_consecutive_samples() {
        let verdicts = Arc::new(AtomicU32::new(0));
        let last_count = Arc::new(AtomicU32::new(0));
        let sampler: ContentionSampler = Arc::new(|| {
            Some(ContentionSample {
                running: vec![claims(1, &["a"], &["b"]), claims(2, &["b"], &["a"])],
                paused: vec![],
            })
        });
        let action: DeadlockAction = {
            let verdicts = Arc::clone(&verdicts);
            let last_count = Arc::clone(&last_count);
            Arc::new(move |report: &DeadlockReport| {
                last_count.store(report.blocked_samples, Ordering::SeqCst);
                verdicts.fetch_add(1, Ordering::SeqCst);
            })
        };
        let watchdog =
            DeadlockWatchdog::new(Duration::from_millis(10), 3, sampler, action).unwrap();
        watchdog.start(&ThreadSpawner::new()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        watchdog.stop();
        assert_eq!(watchdog.state(), WatchdogState::Stopped);
        assert!(verdicts.load(Ordering::SeqCst) >= 1);
        assert_eq!(last_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clear_samples_never_trigger() {
        let verdicts = Arc::new(AtomicU32::new(0));
        let action: DeadlockAction = {
            let verdicts = Arc::clone(&verdicts);
            Arc::new(move |_: &DeadlockReport| {
                verdicts.fetch_add(1, Ordering::SeqCst);
            })
        };
        let watchdog = DeadlockWatchdog::new(
            Duration::from_millis(5),
            2,
            Arc::new(|| Some(ContentionSample::default())),
            action,
        )
        .unwrap();
        watchdog.start(&ThreadSpawner::new()).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        watchdog.stop();
        assert_eq!(verdicts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loop_exits_when_sampler_is_gone() {
        let watchdog = DeadlockWatchdog::new(
            Duration::from_millis(5),
            2,
            Arc::new(|| -> Option<ContentionSample> { None }),
            Arc::new(|_: &DeadlockReport| {}),
        )
        .unwrap();
        watchdog.start(&ThreadSpawner::new()).unwrap();
        watchdog.stop();
        assert_eq!(watchdog.state(), WatchdogState::Stopped);
    }
}
