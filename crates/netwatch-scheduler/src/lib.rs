//! netwatch-scheduler — a reusable periodic-execution primitive.
//!
//! `PeriodicScheduler` invokes a caller-supplied action on a fixed-delay
//! cadence and guarantees that two invocations of the same scheduler never
//! overlap. Besides the cadence it accepts on-demand `delay()` requests,
//! coalesced through a bounded counter, and runtime period changes.
//!
//! # Architecture
//!
//! ```text
//! PeriodicScheduler
//!   ├── ExecutionBackend (when to fire)
//!   │   ├── supplied tokio Handle, or
//!   │   └── owned single-worker runtime, torn down on stop()
//!   ├── optional executor Handle (where the action runs)
//!   └── Runner
//!       ├── run gate (last run start, serialises the action)
//!       └── pending delay() counter (0..=10)
//! ```

pub mod backend;
pub mod error;
pub mod scheduler;
pub mod time_unit;

pub use backend::{BoxFuture, ExecutionBackend, Job, TaskHandle, TokioBackend};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Action, PeriodicScheduler, MAX_PENDING_DELAYS};
pub use time_unit::TimeUnit;
