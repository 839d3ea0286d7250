//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset: scheduler lifecycle, preemption and
/// watchdog verdicts, without per-task placement chatter.
pub const DEFAULT_FILTER: &str = "prometheus_slot_scheduler=info";

/// Install an env-filtered fmt subscriber unless one is already set.
///
/// Task and watcher threads log with `task_id` fields; enabling thread names makes the
/// `slot-task-*` / `slot-timeout-*` threads visible in the output.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
