//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while starting a scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to build scheduler runtime: {0}")]
    Backend(#[from] std::io::Error),

    #[error("no tokio runtime available in the current context")]
    NoRuntime,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
