//! Core scheduling engine: priorities, task handles, shared resources, placement and
//! deadlock detection.

pub mod error;
pub mod priority;
pub mod resource_store;
pub mod scheduler;
pub mod spawn;
pub mod task_handle;
pub mod watchdog;

pub use error::{SchedulerError, SchedulerResult};
pub use priority::Priority;
pub use resource_store::{ClaimSnapshot, ResourceClaims, ResourceStore};
pub use scheduler::{Scheduler, TaskBody};
pub use spawn::{Job, Spawn};
pub use task_handle::{TaskHandle, TaskId};
pub use watchdog::{
    terminate_process, ContentionSample, ContentionSampler, DeadlockAction, DeadlockReport,
    DeadlockWatchdog, TaskClaims, WatchdogState, DEADLOCK_EXIT_CODE,
};
