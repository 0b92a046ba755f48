//! netwatch-health — network-partition watchdog.
//!
//! Probes a set of reachability targets on a fixed cadence and gates a set
//! of managed components on the aggregate verdict: when no target answers
//! the node is assumed isolated and its components are stopped; once any
//! target answers again they are restarted.
//!
//! # Architecture
//!
//! ```text
//! Watchdog
//!   ├── PeriodicScheduler (recurring, auto-started once there is
//!   │   at least one target and one component)
//!   └── tick
//!       ├── ReachabilityProbe
//!       │   ├── addresses: TCP echo connect → ping subprocess
//!       │   └── urls: HTTP GET + full body read
//!       └── ManagedComponent start()/stop() where state disagrees
//! ```
//!
//! A watchdog with no targets is vacuously healthy and never stops
//! anything.

pub mod error;
pub mod probe;
pub mod watchdog;

pub use error::{WatchdogError, WatchdogResult};
pub use probe::{NetworkProbe, ReachabilityProbe};
pub use watchdog::{parse_url, resolve_address, TickOutcome, Watchdog};
