//! Execution backends — decide when scheduled jobs fire.
//!
//! An [`ExecutionBackend`] accepts recurring (fixed-delay) and one-shot
//! registrations and can be shut down immediately. [`TokioBackend`] is the
//! tokio implementation: it either borrows a caller's runtime through a
//! `Handle` or owns a dedicated single-worker runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of work the backend can fire repeatedly.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability the scheduler consumes to register timed work.
pub trait ExecutionBackend: Send + Sync {
    /// Fire `job` after `initial_delay`, then again `delay` after each run
    /// completes, until the returned handle is cancelled.
    fn schedule_with_fixed_delay(
        &self,
        job: Job,
        initial_delay: Duration,
        delay: Duration,
    ) -> TaskHandle;

    /// Fire `job` once after `delay`.
    fn schedule(&self, job: Job, delay: Duration) -> TaskHandle;

    /// Stop the backend immediately. In-flight work may be abandoned.
    fn shutdown_now(&self);
}

/// Cancelable handle for a registered job.
///
/// Cancellation is cooperative: a job that is already running completes,
/// only future firings are prevented. Dropping the handle does not cancel.
pub struct TaskHandle {
    cancel_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Whether the underlying task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Tokio-backed execution backend.
pub struct TokioBackend {
    handle: Handle,
    /// Present when this backend owns its runtime.
    runtime: Mutex<Option<Runtime>>,
}

impl TokioBackend {
    /// Borrow an existing runtime. `shutdown_now` leaves it running.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            runtime: Mutex::new(None),
        }
    }

    /// Borrow the runtime of the calling context.
    pub fn current() -> SchedulerResult<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|_| SchedulerError::NoRuntime)
    }

    /// Build a dedicated runtime with a single worker thread named
    /// `<name>-scheduled`.
    pub fn dedicated(name: &str) -> SchedulerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{name}-scheduled"))
            .enable_all()
            .build()?;
        debug!(%name, "dedicated scheduler runtime created");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Whether this backend owns a runtime that is still alive.
    pub fn is_dedicated(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl ExecutionBackend for TokioBackend {
    fn schedule_with_fixed_delay(
        &self,
        job: Job,
        initial_delay: Duration,
        delay: Duration,
    ) -> TaskHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let join = self.handle.spawn(async move {
            let mut wait = initial_delay;
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel_rx) => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                job().await;
                wait = delay;
            }
        });
        TaskHandle { cancel_tx, join }
    }

    fn schedule(&self, job: Job, delay: Duration) -> TaskHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let join = self.handle.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => {}
                _ = tokio::time::sleep(delay) => job().await,
            }
        });
        TaskHandle { cancel_tx, join }
    }

    fn shutdown_now(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!("dedicated scheduler runtime shut down");
        }
    }
}

impl Drop for TokioBackend {
    fn drop(&mut self) {
        // A runtime dropped inside async context panics; shut it down instead.
        self.shutdown_now();
    }
}

/// Resolves once cancellation is requested. A dropped sender never resolves.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}
