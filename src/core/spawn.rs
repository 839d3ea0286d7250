//! Abstraction over the pool that runs task bodies, watchers and the watchdog loop.

use super::SchedulerResult;

/// A unit of blocking work handed to a [`Spawn`] backend.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Abstraction for starting blocking jobs on an execution backend.
///
/// Jobs block (task bodies park on their pause gate or on resource locks), so a backend
/// must give every job its own thread of execution and must never run a job inline on
/// the calling thread: the scheduler submits jobs while holding its collection locks.
pub trait Spawn: Send + Sync {
    /// Start `job`. `name` is a short label for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Spawn` if the backend cannot accept the job.
    fn spawn(&self, name: String, job: Job) -> SchedulerResult<()>;
}
