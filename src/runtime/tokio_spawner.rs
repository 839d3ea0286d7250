//! Tokio runtime spawner implementation.

use std::sync::Arc;

use crate::core::{Job, SchedulerError, SchedulerResult, Spawn};

/// Tokio-based spawner that runs jobs on a runtime's blocking thread pool.
///
/// Task bodies block on pause gates and resource locks, so they go through
/// `spawn_blocking` rather than onto the async worker threads. The runtime must
/// allow at least as many blocking threads as there are concurrently live jobs.
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: Arc<tokio::runtime::Handle>,
}

impl TokioSpawner {
    /// Create a new `TokioSpawner` from a tokio runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Create a `TokioSpawner` for the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Spawn` when called outside a tokio runtime.
    pub fn current() -> SchedulerResult<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| SchedulerError::Spawn(e.to_string()))
    }
}

impl Spawn for TokioSpawner {
    fn spawn(&self, name: String, job: Job) -> SchedulerResult<()> {
        tracing::trace!(job = %name, "spawning blocking job on tokio");
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}
