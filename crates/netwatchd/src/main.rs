//! netwatchd — the netwatch daemon.
//!
//! Probes a set of network targets and keeps guarded processes running
//! only while at least one target is reachable.
//!
//! # Usage
//!
//! ```text
//! netwatchd run --address 10.0.0.1 --address 10.0.0.2 --guard "broker --listen 0.0.0.0:5445"
//! netwatchd check --config /etc/netwatch.toml
//! ```

mod component;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use netwatch_core::{ManagedComponent, WatchdogConfig};
use netwatch_health::Watchdog;

use crate::component::ProcessComponent;

#[derive(Parser)]
#[command(name = "netwatchd", about = "Network partition watchdog daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the network and gate guarded processes on reachability.
    Run {
        #[command(flatten)]
        targets: TargetArgs,

        /// Command to run while the network is healthy. Repeatable.
        #[arg(long = "guard", required = true)]
        guards: Vec<String>,
    },
    /// Probe the configured targets once and report the verdict.
    Check {
        #[command(flatten)]
        targets: TargetArgs,
    },
}

#[derive(Args, Debug, Default)]
struct TargetArgs {
    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local interface probes are bound to.
    #[arg(long)]
    interface: Option<String>,

    /// Check period in milliseconds.
    #[arg(long)]
    check_period_ms: Option<u64>,

    /// Per-probe timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Address to probe (IP or host name). Repeatable.
    #[arg(long = "address")]
    addresses: Vec<String>,

    /// HTTP endpoint to probe. Repeatable.
    #[arg(long = "url")]
    urls: Vec<String>,

    /// Disable the ping subprocess fallback.
    #[arg(long)]
    no_ping: bool,
}

impl TargetArgs {
    /// Defaults, then the config file, then the environment, then flags.
    fn load(&self) -> anyhow::Result<WatchdogConfig> {
        let mut config = match &self.config {
            Some(path) => WatchdogConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => WatchdogConfig::default(),
        };
        config.apply_env()?;
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut WatchdogConfig) {
        if let Some(interface) = &self.interface {
            config.interface = Some(interface.clone());
        }
        if let Some(period) = self.check_period_ms {
            config.check_period_ms = period;
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout_ms = timeout;
        }
        config.addresses.extend(self.addresses.iter().cloned());
        config.urls.extend(self.urls.iter().cloned());
        if self.no_ping {
            config.ping_fallback = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,netwatch_health=debug,netwatch_scheduler=debug,netwatchd=debug",
                )
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { targets, guards } => run(targets.load()?, &guards).await,
        Command::Check { targets } => check(targets.load()?).await,
    }
}

async fn run(config: WatchdogConfig, guards: &[String]) -> anyhow::Result<()> {
    info!(
        period = ?config.check_period(),
        timeout_ms = config.timeout_ms,
        interface = ?config.interface,
        "netwatch daemon starting"
    );

    let watchdog = Watchdog::new(&config);

    let mut components = Vec::new();
    for guard in guards {
        let component = Arc::new(ProcessComponent::parse(guard)?);
        watchdog.add_component(component.clone()).await?;
        components.push(component);
    }
    watchdog.seed(&config).await?;

    if !watchdog.is_started() {
        warn!("no reachable targets configured, guarded processes run unconditionally");
    }

    // Bring guarded processes up without waiting a full period.
    let outcome = watchdog.tick().await;
    info!(healthy = outcome.healthy, started = outcome.started, "initial check complete");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    watchdog.stop().await;
    for component in &components {
        if component.is_started() {
            if let Err(e) = component.stop().await {
                warn!(component = %component.name(), error = %e, "error stopping component");
            }
        }
    }

    info!("netwatch daemon stopped");
    Ok(())
}

async fn check(config: WatchdogConfig) -> anyhow::Result<()> {
    let watchdog = Watchdog::from_config(&config).await?;
    let healthy = watchdog.check().await;
    info!(
        healthy,
        addresses = watchdog.addresses().await.len(),
        urls = watchdog.urls().await.len(),
        "reachability check complete"
    );
    if !healthy {
        anyhow::bail!("no configured target is reachable");
    }
    Ok(())
}
