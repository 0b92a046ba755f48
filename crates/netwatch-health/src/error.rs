//! Watchdog error types.

use thiserror::Error;

use netwatch_scheduler::SchedulerError;

pub type WatchdogResult<T> = Result<T, WatchdogError>;

/// Errors surfaced to callers configuring a watchdog.
///
/// Probe failures and component lifecycle failures are never errors; they
/// are logged and folded into the tick verdict.
#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported url scheme {0:?}, only http is supported")]
    UnsupportedScheme(String),

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}
