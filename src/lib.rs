//! # Prometheus Slot Scheduler
//!
//! A user-space priority scheduler for blocking work on a fixed number of execution
//! slots, with cooperative preemption, named shared resources and a deadlock watchdog.
//!
//! ## Core Problem Solved
//!
//! Some workloads submit far more units of work than there are threads to run them, and
//! not all of it is equally urgent:
//!
//! - **Bounded concurrency**: at most `max_concurrency` task bodies occupy a slot
//! - **Priority placement**: the most urgent task (lowest value, `0..=20`) gets the next
//!   free slot, FIFO within a priority
//! - **Preemption**: optionally, urgent work displaces less urgent running work, which
//!   parks at its next cooperative pause point and resumes later
//! - **Shared state**: tasks coordinate through named, individually locked resources
//! - **Stall detection**: a watchdog notices when tasks are stuck waiting on each other's
//!   resources and terminates the process
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use prometheus_slot_scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new(2, true, true, None)?;
//!
//! scheduler.schedule_task(
//!     |task| {
//!         for _ in 0..10 {
//!             if task.is_paused() {
//!                 task.pause();
//!             }
//!             if task.is_canceled() {
//!                 return;
//!             }
//!             task.take_resource::<u64, _>("progress", |n| *n.get_or_insert(0) += 1)
//!                 .expect("progress holds a u64");
//!         }
//!     },
//!     15,
//!     Some(Duration::from_secs(30)),
//! )?;
//! # Ok::<(), prometheus_slot_scheduler::SchedulerError>(())
//! ```
//!
//! Cancellation and pausing are cooperative: a body that never polls its handle keeps
//! running past its time limit and never yields its slot to preemption.
//!
//! For complete examples, see `tests/scheduler_test.rs` and `tests/deadlock_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling engine.
pub mod core;
/// Configuration models for the scheduler and watchdog.
pub mod config;
/// Builders to construct schedulers from configuration.
pub mod builders;
/// Execution backends (OS threads, tokio blocking pool).
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use crate::builders::SchedulerBuilder;
pub use crate::config::{SchedulerConfig, WatchdogConfig};
pub use crate::core::{
    DeadlockAction, DeadlockReport, Priority, ResourceStore, Scheduler, SchedulerError,
    SchedulerResult, Spawn, TaskHandle, TaskId, WatchdogState, DEADLOCK_EXIT_CODE,
};
