//! OS-thread spawner, the default execution backend.

use std::thread;

use crate::core::{Job, SchedulerError, SchedulerResult, Spawn};

/// Runs every job on a fresh named OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadSpawner {
    stack_size: Option<usize>,
}

impl ThreadSpawner {
    /// Spawner using the platform's default thread stack size.
    #[must_use]
    pub const fn new() -> Self {
        Self { stack_size: None }
    }

    /// Spawner using a custom stack size in bytes.
    #[must_use]
    pub const fn with_stack_size(stack_size: usize) -> Self {
        Self {
            stack_size: Some(stack_size),
        }
    }
}

impl Spawn for ThreadSpawner {
    fn spawn(&self, name: String, job: Job) -> SchedulerResult<()> {
        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder
            .spawn(job)
            .map(|_detached| ())
            .map_err(|e| SchedulerError::Spawn(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_job_runs_on_named_thread() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        ThreadSpawner::with_stack_size(256 * 1024)
            .spawn(
                "ss-test".into(),
                Box::new(move || {
                    let name = thread::current().name().map(str::to_owned);
                    tx.send(name).unwrap();
                }),
            )
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("ss-test"));
    }
}
