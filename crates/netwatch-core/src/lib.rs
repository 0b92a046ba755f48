//! netwatch-core — shared types for the netwatch partition watchdog.
//!
//! - [`WatchdogConfig`]: interface binding, cadence, probe timeouts and
//!   initial targets, loaded from defaults, TOML and the environment.
//! - [`ManagedComponent`]: the narrow start/stop/is-started capability the
//!   watchdog drives. Implementations live outside this workspace's core.

pub mod component;
pub mod config;
pub mod error;

pub use component::{BoxFuture, ManagedComponent};
pub use config::WatchdogConfig;
pub use error::{ConfigError, ConfigResult};
