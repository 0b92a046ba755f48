//! The managed component capability.

use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future used at the trait seams of this workspace.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A service whose lifecycle is gated by the watchdog's verdict.
///
/// The watchdog never owns the lifecycle logic. It only calls `start` when
/// the network is healthy and the component reports itself stopped, and
/// `stop` in the opposite case. Errors are logged by the caller and never
/// abort processing of other components.
pub trait ManagedComponent: Send + Sync {
    /// Human-readable name used in log lines.
    fn name(&self) -> &str;

    /// Start the component.
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Stop the component.
    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Whether the component is currently running. Must not block.
    fn is_started(&self) -> bool;
}
