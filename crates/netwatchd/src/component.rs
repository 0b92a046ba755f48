//! Process-backed managed components.
//!
//! A `ProcessComponent` runs an external command while the network is
//! healthy and kills it when the node looks isolated.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use netwatch_core::{BoxFuture, ManagedComponent};

pub struct ProcessComponent {
    name: String,
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl ProcessComponent {
    /// Build a component from a whitespace-separated command line.
    pub fn parse(command_line: &str) -> anyhow::Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("guard command is empty");
        };
        Ok(Self {
            name: command_line.trim().to_string(),
            program,
            args: parts.collect(),
            child: Mutex::new(None),
        })
    }

    fn lock_child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ManagedComponent for ProcessComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let child = Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to spawn {:?}", self.name))?;
            info!(component = %self.name, pid = ?child.id(), "process started");
            *self.lock_child() = Some(child);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let child = self.lock_child().take();
            if let Some(mut child) = child {
                child
                    .kill()
                    .await
                    .with_context(|| format!("failed to kill {:?}", self.name))?;
                info!(component = %self.name, "process stopped");
            }
            Ok(())
        })
    }

    fn is_started(&self) -> bool {
        let mut guard = self.lock_child();
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(component = %self.name, %status, "process exited on its own");
                *guard = None;
                false
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_splits_program_and_args() {
        let c = ProcessComponent::parse("  sleep   30 ").unwrap();
        assert_eq!(c.program, "sleep");
        assert_eq!(c.args, vec!["30"]);
        assert_eq!(c.name(), "sleep   30");
    }

    #[test]
    fn parse_rejects_empty_command() {
        assert!(ProcessComponent::parse("   ").is_err());
    }

    #[tokio::test]
    async fn not_started_until_started() {
        let c = ProcessComponent::parse("sleep 30").unwrap();
        assert!(!c.is_started());
        // Stopping a component that never ran is a no-op.
        c.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_and_stop_process() {
        let c = ProcessComponent::parse("sleep 30").unwrap();
        c.start().await.unwrap();
        assert!(c.is_started());

        c.stop().await.unwrap();
        assert!(!c.is_started());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_reports_stopped() {
        let c = ProcessComponent::parse("true").unwrap();
        c.start().await.unwrap();

        let mut exited = false;
        for _ in 0..50 {
            if !c.is_started() {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let c = ProcessComponent::parse("/nonexistent/netwatch-guarded").unwrap();
        assert!(c.start().await.is_err());
        assert!(!c.is_started());
    }
}
