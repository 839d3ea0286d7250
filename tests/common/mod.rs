//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use prometheus_slot_scheduler::util::init_tracing;
use prometheus_slot_scheduler::{Scheduler, SchedulerConfig, WatchdogConfig};

/// Scheduler without a watchdog, for placement-only tests.
pub fn scheduler(max_concurrency: usize, preemptive: bool, realtime: bool) -> Scheduler {
    init_tracing();
    Scheduler::builder(
        SchedulerConfig::new()
            .with_max_concurrency(max_concurrency)
            .with_preemptive(preemptive)
            .with_realtime(realtime)
            .with_watchdog(WatchdogConfig {
                enabled: false,
                ..WatchdogConfig::default()
            }),
    )
    .build()
    .expect("valid test configuration")
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
