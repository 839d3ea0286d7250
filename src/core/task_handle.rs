//! Control block shared between the scheduler and a running task body.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::resource_store::{ClaimSnapshot, ResourceClaims, ResourceStore};
use super::{Priority, SchedulerResult};

/// Sequence number assigned when a task is scheduled.
pub type TaskId = u64;

/// Per-task state visible to the task body.
///
/// Cancellation and pausing are cooperative: the scheduler only raises flags, the body
/// is expected to poll [`is_canceled`](Self::is_canceled) and call
/// [`pause`](Self::pause) whenever [`is_paused`](Self::is_paused) reports `true`.
pub struct TaskHandle {
    id: TaskId,
    priority: Priority,
    canceled: AtomicBool,
    finished: AtomicBool,
    /// `true` while the pause gate is closed.
    paused: Mutex<bool>,
    gate: Condvar,
    claims: ResourceClaims,
    store: Arc<ResourceStore>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, priority: Priority, store: Arc<ResourceStore>) -> Self {
        Self {
            id,
            priority,
            canceled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            paused: Mutex::new(false),
            gate: Condvar::new(),
            claims: ResourceClaims::new(),
            store,
        }
    }

    /// Identifier of the task, in submission order.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Priority the task was scheduled with.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether the body has been asked to stop.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Whether the scheduler wants the body to park at its next safe point.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Whether the body has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Block until the scheduler resumes this task.
    ///
    /// Returns immediately when the task is not paused. Cancellation also releases the
    /// gate so a paused task can observe [`is_canceled`](Self::is_canceled) and exit.
    pub fn pause(&self) {
        let mut paused = self.paused.lock();
        if *paused {
            trace!(task_id = self.id, "task parked");
        }
        while *paused && !self.is_canceled() {
            self.gate.wait(&mut paused);
        }
    }

    /// Run `mutator` on shared resource `name` while holding its lock.
    ///
    /// See [`ResourceStore::use_resource`] for the full contract.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ResourceTypeMismatch` when `name` holds another type and
    /// `SchedulerError::NestedResource` when this task already holds `name`.
    pub fn take_resource<T, F>(&self, name: &str, mutator: F) -> SchedulerResult<()>
    where
        T: Any + Send,
        F: FnOnce(&mut Option<T>),
    {
        self.store.use_resource(name, &self.claims, mutator)
    }

    /// Held/wanted resource names at this instant.
    #[must_use]
    pub fn claims(&self) -> ClaimSnapshot {
        self.claims.snapshot()
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        // Take the gate lock so a body between its check and its wait sees the flag.
        let _paused = self.paused.lock();
        self.gate.notify_all();
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn request_pause(&self) {
        *self.paused.lock() = true;
    }

    pub(crate) fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.gate.notify_all();
    }

    /// Finished or canceled tasks no longer need a slot.
    pub(crate) fn is_done(&self) -> bool {
        self.is_finished() || self.is_canceled()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("canceled", &self.is_canceled())
            .field("paused", &self.is_paused())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn handle() -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(1, Priority::DEFAULT, Arc::new(ResourceStore::new())))
    }

    #[test]
    fn test_pause_is_noop_when_not_paused() {
        let h = handle();
        h.pause();
        assert!(!h.is_paused());
    }

    #[test]
    fn test_pause_blocks_until_resume() {
        let h = handle();
        h.request_pause();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                h.pause();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        h.resume();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.join().unwrap();
        assert!(!h.is_paused());
    }

    #[test]
    fn test_cancel_releases_paused_body() {
        let h = handle();
        h.request_pause();
        let worker = {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                h.pause();
                h.is_canceled()
            })
        };
        thread::sleep(Duration::from_millis(20));
        h.cancel();
        h.cancel();
        assert!(worker.join().unwrap());
        assert!(h.is_done());
    }

    #[test]
    fn test_take_resource_goes_through_store() {
        let store = Arc::new(ResourceStore::new());
        let h = TaskHandle::new(3, Priority::MAX, Arc::clone(&store));
        h.take_resource::<String, _>("log", |v| v.get_or_insert_with(String::new).push('x'))
            .unwrap();
        h.take_resource::<String, _>("log", |v| v.get_or_insert_with(String::new).push('y'))
            .unwrap();
        assert_eq!(store.read::<String>("log").unwrap().as_deref(), Some("xy"));
        assert_eq!(h.claims(), ClaimSnapshot::default());
    }
}
