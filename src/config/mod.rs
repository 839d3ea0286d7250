//! Configuration models for the scheduler and its watchdog.

pub mod scheduler;

pub use scheduler::{SchedulerConfig, WatchdogConfig};
