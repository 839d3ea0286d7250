//! Priority slot scheduler.
//!
//! The scheduler owns three collections:
//!
//! - **pending**: accepted tasks ordered by priority, FIFO within a priority,
//! - **slots**: a fixed arena of execution positions, each empty or occupied,
//! - **paused**: tasks taken out of a slot by preemption, parked on their pause gate.
//!
//! A placement pass ([`Scheduler::refresh_tasks`]) first releases slots whose task
//! finished or was canceled, then fills empty slots with the most urgent candidate, and
//! in preemptive mode keeps swapping the least urgent running task for a strictly more
//! urgent candidate. Between a pending and a paused candidate of equal priority the
//! paused one wins, it started earlier.
//!
//! The three collection locks are always taken in the order pending, slots, paused and
//! are never held across a suspension point of a task body.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::resource_store::ResourceStore;
use super::task_handle::{TaskHandle, TaskId};
use super::watchdog::{
    ContentionSample, ContentionSampler, DeadlockAction, DeadlockWatchdog, TaskClaims,
    WatchdogState,
};
use super::{Priority, SchedulerError, SchedulerResult, Spawn};
use crate::builders::SchedulerBuilder;
use crate::config::SchedulerConfig;

/// A task body. It receives the handle it must poll for pause and cancel requests.
pub type TaskBody = Box<dyn FnOnce(Arc<TaskHandle>) + Send + 'static>;

struct PendingTask {
    id: TaskId,
    priority: Priority,
    time_limit: Option<Duration>,
    body: TaskBody,
}

/// A task that has been given a slot at least once.
struct ActiveTask {
    handle: Arc<TaskHandle>,
    /// Dropping the sender wakes the timeout watcher, which then exits.
    _disarm: Option<Sender<()>>,
}

enum Slot {
    Empty,
    Occupied(ActiveTask),
}

impl Slot {
    const fn task(&self) -> Option<&ActiveTask> {
        match self {
            Self::Occupied(task) => Some(task),
            Self::Empty => None,
        }
    }

    fn take(&mut self) -> Option<ActiveTask> {
        match std::mem::replace(self, Self::Empty) {
            Self::Occupied(task) => Some(task),
            Self::Empty => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    /// Head of the pending queue.
    Pending,
    /// Index into the paused collection.
    Paused(usize),
}

/// Most urgent candidate and its priority. Paused wins ties.
fn best_candidate(
    pending: &VecDeque<PendingTask>,
    paused: &[ActiveTask],
) -> Option<(Candidate, Priority)> {
    let head = pending.front().map(|task| task.priority);
    let resumable = paused
        .iter()
        .enumerate()
        .min_by_key(|(_, task)| (task.handle.priority(), task.handle.id()))
        .map(|(index, task)| (index, task.handle.priority()));

    match (head, resumable) {
        (None, None) => None,
        (Some(p), None) => Some((Candidate::Pending, p)),
        (None, Some((index, q))) => Some((Candidate::Paused(index), q)),
        (Some(p), Some((_, q))) if p < q => Some((Candidate::Pending, p)),
        (Some(_), Some((index, q))) => Some((Candidate::Paused(index), q)),
    }
}

/// Slot of the least urgent running task; the latest arrival among equals.
fn worst_running(slots: &[Slot]) -> Option<(usize, Priority)> {
    slots
        .iter()
        .enumerate()
        .filter_map(|(index, slot)| slot.task().map(|task| (index, task)))
        .max_by_key(|(_, task)| (task.handle.priority(), task.handle.id()))
        .map(|(index, task)| (index, task.handle.priority()))
}

/// Position that keeps `pending` sorted: before the first strictly less urgent entry.
fn insertion_index(pending: &VecDeque<PendingTask>, priority: Priority) -> usize {
    pending
        .iter()
        .position(|task| task.priority > priority)
        .unwrap_or(pending.len())
}

struct Inner {
    preemptive: bool,
    realtime: bool,
    global_time_limit: Option<Duration>,
    pending: Mutex<VecDeque<PendingTask>>,
    slots: Mutex<Vec<Slot>>,
    paused: Mutex<Vec<ActiveTask>>,
    store: Arc<ResourceStore>,
    spawner: Arc<dyn Spawn>,
    next_id: AtomicU64,
}

impl Inner {
    fn refresh(self: &Arc<Self>) {
        let mut pending = self.pending.lock();
        let mut slots = self.slots.lock();
        let mut paused = self.paused.lock();

        Self::sweep(&mut slots, &mut paused);
        if pending.is_empty() && paused.is_empty() {
            return;
        }

        self.fill_free_slots(&mut pending, &mut slots, &mut paused);
        if self.preemptive {
            self.preempt(&mut pending, &mut slots, &mut paused);
            self.fill_free_slots(&mut pending, &mut slots, &mut paused);
        }
    }

    fn sweep(slots: &mut [Slot], paused: &mut Vec<ActiveTask>) {
        for (index, slot) in slots.iter_mut().enumerate() {
            let done = slot.task().is_some_and(|task| task.handle.is_done());
            if done {
                if let Some(task) = slot.take() {
                    debug!(slot = index, task_id = task.handle.id(), "slot released");
                }
            }
        }
        paused.retain(|task| {
            let keep = !task.handle.is_done();
            if !keep {
                debug!(task_id = task.handle.id(), "dropping finished paused task");
            }
            keep
        });
    }

    fn fill_free_slots(
        self: &Arc<Self>,
        pending: &mut VecDeque<PendingTask>,
        slots: &mut [Slot],
        paused: &mut Vec<ActiveTask>,
    ) {
        for index in 0..slots.len() {
            while matches!(slots[index], Slot::Empty) {
                let Some((candidate, _)) = best_candidate(pending, paused) else {
                    return;
                };
                if let Some(task) = self.promote(candidate, pending, paused) {
                    debug!(slot = index, task_id = task.handle.id(), "slot assigned");
                    slots[index] = Slot::Occupied(task);
                }
            }
        }
    }

    fn preempt(
        self: &Arc<Self>,
        pending: &mut VecDeque<PendingTask>,
        slots: &mut [Slot],
        paused: &mut Vec<ActiveTask>,
    ) {
        while let (Some((index, worst)), Some((candidate, best))) =
            (worst_running(slots), best_candidate(pending, paused))
        {
            if best >= worst {
                break;
            }
            let Some(evicted) = slots[index].take() else {
                break;
            };
            evicted.handle.request_pause();
            info!(
                slot = index,
                task_id = evicted.handle.id(),
                priority = %worst,
                incoming_priority = %best,
                "preempting task"
            );

            // The candidate is picked before the evicted task joins the paused set.
            if let Some(task) = self.promote(candidate, pending, paused) {
                slots[index] = Slot::Occupied(task);
            }
            if !evicted.handle.is_done() {
                paused.push(evicted);
            }
        }
    }

    fn promote(
        self: &Arc<Self>,
        candidate: Candidate,
        pending: &mut VecDeque<PendingTask>,
        paused: &mut Vec<ActiveTask>,
    ) -> Option<ActiveTask> {
        match candidate {
            Candidate::Paused(index) => {
                let task = paused.remove(index);
                task.handle.resume();
                debug!(task_id = task.handle.id(), "resuming paused task");
                Some(task)
            }
            Candidate::Pending => pending.pop_front().and_then(|task| self.spawn(task)),
        }
    }

    fn spawn(self: &Arc<Self>, task: PendingTask) -> Option<ActiveTask> {
        let PendingTask {
            id,
            priority,
            time_limit,
            body,
        } = task;
        let handle = Arc::new(TaskHandle::new(id, priority, Arc::clone(&self.store)));
        let disarm = time_limit.and_then(|limit| self.arm_timeout(&handle, limit));

        let job = {
            let handle = Arc::clone(&handle);
            let scheduler = Arc::downgrade(self);
            Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(Arc::clone(&handle))));
                handle.mark_finished();
                if outcome.is_err() {
                    warn!(task_id = id, "task body panicked");
                } else {
                    debug!(task_id = id, "task body returned");
                }
                Self::refresh_after_event(&scheduler);
            })
        };

        match self.spawner.spawn(format!("slot-task-{id}"), job) {
            Ok(()) => {
                debug!(task_id = id, priority = %priority, ?time_limit, "task started");
                Some(ActiveTask {
                    handle,
                    _disarm: disarm,
                })
            }
            Err(e) => {
                error!(task_id = id, error = %e, "failed to start task, dropping it");
                handle.cancel();
                None
            }
        }
    }

    /// Start a watcher that cancels the task once `limit` elapses.
    ///
    /// Watchers run outside the slot budget.
    fn arm_timeout(self: &Arc<Self>, handle: &Arc<TaskHandle>, limit: Duration) -> Option<Sender<()>> {
        let (disarm, disarmed) = bounded::<()>(0);
        let handle = Arc::clone(handle);
        let id = handle.id();
        let scheduler = Arc::downgrade(self);
        let job = Box::new(move || {
            if disarmed.recv_timeout(limit) == Err(RecvTimeoutError::Timeout) && !handle.is_finished() {
                warn!(task_id = handle.id(), ?limit, "time limit exceeded, canceling task");
                handle.cancel();
                Self::refresh_after_event(&scheduler);
            }
        });

        match self.spawner.spawn(format!("slot-timeout-{id}"), job) {
            Ok(()) => Some(disarm),
            Err(e) => {
                error!(task_id = id, error = %e, "failed to start timeout watcher");
                None
            }
        }
    }

    fn refresh_after_event(scheduler: &Weak<Self>) {
        if let Some(inner) = scheduler.upgrade() {
            if inner.realtime {
                inner.refresh();
            }
        }
    }

    fn sample(&self) -> ContentionSample {
        let slots = self.slots.lock();
        let paused = self.paused.lock();
        let claims = |task: &ActiveTask| TaskClaims {
            id: task.handle.id(),
            claims: task.handle.claims(),
        };
        ContentionSample {
            running: slots.iter().filter_map(Slot::task).map(claims).collect(),
            paused: paused.iter().map(claims).collect(),
        }
    }
}

/// Priority scheduler over a fixed number of execution slots.
///
/// Dropping the scheduler stops its watchdog and cancels every paused task, which opens
/// their pause gates. Running task bodies are not interrupted; they keep their threads
/// until they return.
pub struct Scheduler {
    inner: Arc<Inner>,
    max_task_count: usize,
    watchdog: Option<DeadlockWatchdog>,
}

impl Scheduler {
    /// Create a scheduler with a default watchdog that terminates the process on a
    /// deadlock verdict, running tasks on dedicated OS threads.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` when `max_concurrency` is zero or the
    /// global time limit is zero.
    pub fn new(
        max_concurrency: usize,
        preemptive: bool,
        realtime: bool,
        global_time_limit: Option<Duration>,
    ) -> SchedulerResult<Self> {
        let builder = Self::builder(
            SchedulerConfig::new()
                .with_max_concurrency(max_concurrency)
                .with_preemptive(preemptive)
                .with_realtime(realtime),
        );
        match global_time_limit {
            Some(limit) => builder.global_time_limit(limit).build(),
            None => builder.build(),
        }
    }

    /// Start building a scheduler from `config`.
    #[must_use]
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub(crate) fn from_parts(
        config: &SchedulerConfig,
        global_time_limit: Option<Duration>,
        spawner: Arc<dyn Spawn>,
        on_deadlock: DeadlockAction,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        if global_time_limit.is_some_and(|limit| limit.is_zero()) {
            return Err(SchedulerError::invalid(
                "global_time_limit",
                "must be greater than 0 when set",
            ));
        }

        let inner = Arc::new(Inner {
            preemptive: config.preemptive,
            realtime: config.realtime,
            global_time_limit,
            pending: Mutex::new(VecDeque::new()),
            slots: Mutex::new((0..config.max_concurrency).map(|_| Slot::Empty).collect()),
            paused: Mutex::new(Vec::new()),
            store: Arc::new(ResourceStore::new()),
            spawner,
            next_id: AtomicU64::new(0),
        });

        let watchdog = if config.watchdog.enabled {
            let sampler: ContentionSampler = {
                let inner = Arc::downgrade(&inner);
                Arc::new(move || inner.upgrade().map(|inner| inner.sample()))
            };
            let watchdog = DeadlockWatchdog::new(
                config.watchdog.period(),
                config.watchdog.blocked_threshold,
                sampler,
                on_deadlock,
            )?;
            watchdog.start(inner.spawner.as_ref())?;
            Some(watchdog)
        } else {
            None
        };

        info!(
            max_concurrency = config.max_concurrency,
            preemptive = config.preemptive,
            realtime = config.realtime,
            ?global_time_limit,
            watchdog = config.watchdog.enabled,
            "scheduler initialized"
        );

        Ok(Self {
            inner,
            max_task_count: config.max_concurrency,
            watchdog,
        })
    }

    /// Accept a task at `priority` (0 most urgent, 20 least urgent).
    ///
    /// `time_limit` of `None` inherits the scheduler's global limit. The task is queued
    /// behind every pending task of equal or more urgent priority. In realtime mode a
    /// placement pass runs before this returns.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` for a priority outside `[0, 20]` or a
    /// zero time limit.
    pub fn schedule_task<F>(
        &self,
        body: F,
        priority: i32,
        time_limit: Option<Duration>,
    ) -> SchedulerResult<()>
    where
        F: FnOnce(Arc<TaskHandle>) + Send + 'static,
    {
        let priority = Priority::new(priority)?;
        if time_limit.is_some_and(|limit| limit.is_zero()) {
            return Err(SchedulerError::invalid("time_limit", "must be greater than 0 when set"));
        }
        self.enqueue(Box::new(body), priority, time_limit.or(self.inner.global_time_limit));
        Ok(())
    }

    /// Accept a task at the default priority with the inherited time limit.
    pub fn schedule_default<F>(&self, body: F)
    where
        F: FnOnce(Arc<TaskHandle>) + Send + 'static,
    {
        self.enqueue(Box::new(body), Priority::DEFAULT, self.inner.global_time_limit);
    }

    fn enqueue(&self, body: TaskBody, priority: Priority, time_limit: Option<Duration>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.inner.pending.lock();
            let at = insertion_index(&pending, priority);
            pending.insert(
                at,
                PendingTask {
                    id,
                    priority,
                    time_limit,
                    body,
                },
            );
            debug!(task_id = id, priority = %priority, position = at, "task queued");
        }
        if self.inner.realtime {
            self.inner.refresh();
        }
    }

    /// Run a placement pass. Safe to call from any thread, any number of times.
    pub fn refresh_tasks(&self) {
        self.inner.refresh();
    }

    /// Number of slots.
    #[must_use]
    pub const fn max_task_count(&self) -> usize {
        self.max_task_count
    }

    /// Number of tasks waiting for their first slot.
    #[must_use]
    pub fn currently_pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn currently_running(&self) -> usize {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|slot| slot.task().is_some())
            .count()
    }

    /// Number of preempted tasks waiting to be resumed.
    #[must_use]
    pub fn paused_count(&self) -> usize {
        self.inner.paused.lock().len()
    }

    /// Priorities of the pending tasks in placement order.
    #[must_use]
    pub fn pending_priorities(&self) -> Vec<Priority> {
        self.inner
            .pending
            .lock()
            .iter()
            .map(|task| task.priority)
            .collect()
    }

    /// Handles of the tasks currently occupying a slot, in slot order.
    #[must_use]
    pub fn running_handles(&self) -> Vec<Arc<TaskHandle>> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter_map(Slot::task)
            .map(|task| Arc::clone(&task.handle))
            .collect()
    }

    /// Held/wanted resources of every running and paused task.
    #[must_use]
    pub fn contention_sample(&self) -> ContentionSample {
        self.inner.sample()
    }

    /// Shared resources visible to this scheduler's tasks.
    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceStore> {
        &self.inner.store
    }

    /// Whether urgent work displaces running work.
    #[must_use]
    pub fn is_preemptive(&self) -> bool {
        self.inner.preemptive
    }

    /// Whether placement runs after every submission and completion.
    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.inner.realtime
    }

    /// Time limit inherited by tasks scheduled without one.
    #[must_use]
    pub fn global_time_limit(&self) -> Option<Duration> {
        self.inner.global_time_limit
    }

    /// State of the watchdog, `None` when it is disabled.
    #[must_use]
    pub fn watchdog_state(&self) -> Option<WatchdogState> {
        self.watchdog.as_ref().map(DeadlockWatchdog::state)
    }

    /// Stop the watchdog, wait until its loop has exited and cancel every paused task.
    ///
    /// Paused tasks can never be resumed once the scheduler is gone, so they are released
    /// through cancellation instead. Pending tasks are left untouched.
    pub fn shutdown(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        let paused = self.inner.paused.lock();
        for task in paused.iter() {
            debug!(task_id = task.handle.id(), "canceling paused task on shutdown");
            task.handle.cancel();
        }
        info!(canceled_paused = paused.len(), "scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("max_task_count", &self.max_task_count)
            .field("preemptive", &self.inner.preemptive)
            .field("realtime", &self.inner.realtime)
            .field("pending", &self.currently_pending())
            .field("running", &self.currently_running())
            .field("paused", &self.paused_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: TaskId, priority: u8) -> PendingTask {
        PendingTask {
            id,
            priority: Priority::new(i32::from(priority)).unwrap(),
            time_limit: None,
            body: Box::new(|_: Arc<TaskHandle>| {}),
        }
    }

    fn active(id: TaskId, priority: u8) -> ActiveTask {
        let priority = Priority::new(i32::from(priority)).unwrap();
        ActiveTask {
            handle: Arc::new(TaskHandle::new(id, priority, Arc::new(ResourceStore::new()))),
            _disarm: None,
        }
    }

    #[test]
    fn test_insertion_is_stable_within_priority() {
        let mut queue = VecDeque::new();
        for (id, p) in [(0, 5), (1, 15), (2, 5), (3, 12)] {
            let task = pending(id, p);
            let at = insertion_index(&queue, task.priority);
            queue.insert(at, task);
        }
        let ids: Vec<TaskId> = queue.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 2, 3, 1]);
    }

    #[test]
    fn test_paused_wins_priority_tie() {
        let queue: VecDeque<_> = [pending(5, 4)].into_iter().collect();
        let paused = vec![active(1, 9), active(2, 4)];
        assert_eq!(
            best_candidate(&queue, &paused).map(|(c, _)| c),
            Some(Candidate::Paused(1))
        );
    }

    #[test]
    fn test_strictly_better_pending_wins() {
        let queue: VecDeque<_> = [pending(5, 3)].into_iter().collect();
        let paused = vec![active(2, 4)];
        assert_eq!(
            best_candidate(&queue, &paused),
            Some((Candidate::Pending, Priority::new(3).unwrap()))
        );
        assert_eq!(best_candidate(&VecDeque::new(), &[]), None);
    }

    #[test]
    fn test_oldest_paused_resumes_first() {
        let paused = vec![active(7, 4), active(3, 4)];
        assert_eq!(
            best_candidate(&VecDeque::new(), &paused).map(|(c, _)| c),
            Some(Candidate::Paused(1))
        );
    }

    #[test]
    fn test_worst_running_picks_latest_of_least_urgent() {
        let slots = vec![
            Slot::Occupied(active(1, 15)),
            Slot::Empty,
            Slot::Occupied(active(4, 15)),
            Slot::Occupied(active(2, 3)),
        ];
        assert_eq!(worst_running(&slots), Some((2, Priority::new(15).unwrap())));
        assert_eq!(worst_running(&[Slot::Empty]), None);
    }
}
