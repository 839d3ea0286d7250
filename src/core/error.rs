//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A caller-supplied argument is outside its accepted domain.
    #[error("invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        /// Name of the offending argument.
        argument: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// Configuration failed to parse or validate.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A named resource was used with a different value type than the one it was created with.
    #[error("resource `{name}` holds `{expected}`, requested as `{found}`")]
    ResourceTypeMismatch {
        /// Resource name.
        name: String,
        /// Type established at first use.
        expected: &'static str,
        /// Type requested by the caller.
        found: &'static str,
    },
    /// A task asked for a resource it already holds.
    #[error("resource `{name}` is already held by this task")]
    NestedResource {
        /// Resource name.
        name: String,
    },
    /// The execution backend refused to start a job.
    #[error("spawn failed: {0}")]
    Spawn(String),
}

impl SchedulerError {
    pub(crate) fn invalid(argument: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument,
            reason: reason.into(),
        }
    }
}

/// Result alias used across the crate.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
