//! Watchdog — gates managed components on network reachability.
//!
//! The `Watchdog` owns the target sets and the component set behind one
//! async mutex. Every mutation and every tick hold that mutex, so a tick
//! always sees a consistent snapshot and never races a reconfiguration.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use http::Uri;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use netwatch_core::{ManagedComponent, WatchdogConfig};
use netwatch_scheduler::{Action, BoxFuture, ExecutionBackend, PeriodicScheduler, TimeUnit};

use crate::error::{WatchdogError, WatchdogResult};
use crate::probe::{NetworkProbe, ReachabilityProbe};

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Aggregate reachability verdict.
    pub healthy: bool,
    /// Components started by this tick.
    pub started: usize,
    /// Components stopped by this tick.
    pub stopped: usize,
    /// Components whose start or stop failed.
    pub failed: usize,
}

#[derive(Default)]
struct WatchdogState {
    addresses: HashSet<IpAddr>,
    urls: HashSet<Uri>,
    components: Vec<Arc<dyn ManagedComponent>>,
}

impl WatchdogState {
    fn has_targets(&self) -> bool {
        !self.addresses.is_empty() || !self.urls.is_empty()
    }
}

struct Inner {
    state: Mutex<WatchdogState>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl Inner {
    /// First-success-wins over addresses, then urls. Empty sets are healthy.
    async fn check_targets(&self, addresses: &HashSet<IpAddr>, urls: &HashSet<Uri>) -> bool {
        for address in addresses {
            if self.probe.probe_address(*address).await {
                return true;
            }
        }
        for url in urls {
            if self.probe.probe_url(url).await {
                return true;
            }
        }
        addresses.is_empty() && urls.is_empty()
    }

    async fn tick(&self) -> TickOutcome {
        let state = self.state.lock().await;
        let healthy = self.check_targets(&state.addresses, &state.urls).await;
        let mut outcome = TickOutcome {
            healthy,
            ..Default::default()
        };

        for component in &state.components {
            let name = component.name();
            if healthy && !component.is_started() {
                info!(component = %name, "network is healthy, starting component");
                match component.start().await {
                    Ok(()) => outcome.started += 1,
                    Err(e) => {
                        warn!(component = %name, error = %e, "error starting component");
                        outcome.failed += 1;
                    }
                }
            } else if !healthy && component.is_started() {
                info!(component = %name, "network is unhealthy, stopping component");
                match component.stop().await {
                    Ok(()) => outcome.stopped += 1,
                    Err(e) => {
                        warn!(component = %name, error = %e, "error stopping component");
                        outcome.failed += 1;
                    }
                }
            }
        }

        debug!(
            healthy,
            started = outcome.started,
            stopped = outcome.stopped,
            failed = outcome.failed,
            "watchdog tick complete"
        );
        outcome
    }
}

/// Network-partition watchdog.
pub struct Watchdog {
    inner: Arc<Inner>,
    scheduler: PeriodicScheduler,
}

impl Watchdog {
    /// Create a watchdog probing the real network.
    pub fn new(config: &WatchdogConfig) -> Self {
        let probe = NetworkProbe::from_config(config);
        debug!(interface = ?probe.interface(), "network probe configured");
        Self::with_probe(config, Arc::new(probe))
    }

    /// Create a watchdog with a custom probe strategy.
    pub fn with_probe(config: &WatchdogConfig, probe: Arc<dyn ReachabilityProbe>) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(WatchdogState::default()),
            probe,
        });

        let action: Action = {
            let inner = inner.clone();
            Arc::new(move || -> BoxFuture<'static, ()> {
                let inner = inner.clone();
                Box::pin(async move {
                    inner.tick().await;
                })
            })
        };

        let period = i64::try_from(config.check_period_ms).unwrap_or(i64::MAX);
        let scheduler =
            PeriodicScheduler::new("netwatch", period, TimeUnit::Milliseconds, false, action);

        Self { inner, scheduler }
    }

    /// Create a watchdog and seed it with the targets listed in `config`.
    ///
    /// Entries that cannot be resolved or parsed are logged and skipped.
    pub async fn from_config(config: &WatchdogConfig) -> WatchdogResult<Self> {
        let watchdog = Self::new(config);
        watchdog.seed(config).await?;
        Ok(watchdog)
    }

    /// Use an externally owned execution backend for the scheduler.
    pub fn with_backend(self, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            inner: self.inner,
            scheduler: self.scheduler.with_backend(backend),
        }
    }

    /// Add the addresses and urls listed in `config`.
    pub async fn seed(&self, config: &WatchdogConfig) -> WatchdogResult<()> {
        for host in &config.addresses {
            match resolve_address(host).await {
                Ok(address) => self.add_address(address).await?,
                Err(e) => warn!(error = %e, "skipping configured address"),
            }
        }
        for raw in &config.urls {
            match parse_url(raw) {
                Ok(url) => self.add_url(url).await?,
                Err(e) => warn!(error = %e, "skipping configured url"),
            }
        }
        Ok(())
    }

    /// Register a component. Registering the same instance twice is a no-op.
    pub async fn add_component(&self, component: Arc<dyn ManagedComponent>) -> WatchdogResult<()> {
        let mut state = self.inner.state.lock().await;
        let known = state
            .components
            .iter()
            .any(|c| std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(&component)));
        if !known {
            debug!(component = %component.name(), "component registered");
            state.components.push(component);
        }
        self.check_start(&state)
    }

    pub async fn clear_components(&self) {
        self.inner.state.lock().await.components.clear();
    }

    pub async fn component_count(&self) -> usize {
        self.inner.state.lock().await.components.len()
    }

    /// Add an address target.
    ///
    /// The address is probed once immediately; an unreachable address is
    /// logged but still added.
    pub async fn add_address(&self, address: IpAddr) -> WatchdogResult<()> {
        let mut state = self.inner.state.lock().await;
        if !self.inner.probe.probe_address(address).await {
            warn!(%address, "ping address was not reachable");
        }
        state.addresses.insert(address);
        self.check_start(&state)
    }

    pub async fn remove_address(&self, address: IpAddr) -> bool {
        self.inner.state.lock().await.addresses.remove(&address)
    }

    pub async fn clear_addresses(&self) {
        self.inner.state.lock().await.addresses.clear();
    }

    pub async fn addresses(&self) -> Vec<IpAddr> {
        self.inner.state.lock().await.addresses.iter().copied().collect()
    }

    /// Add a URL target. Only `http` URLs are accepted.
    ///
    /// Like [`add_address`](Self::add_address), the URL is probed once and a
    /// failure is only logged.
    pub async fn add_url(&self, url: Uri) -> WatchdogResult<()> {
        validate_url(&url)?;
        let mut state = self.inner.state.lock().await;
        if !self.inner.probe.probe_url(&url).await {
            warn!(%url, "ping url was not reachable");
        }
        state.urls.insert(url);
        self.check_start(&state)
    }

    pub async fn remove_url(&self, url: &Uri) -> bool {
        self.inner.state.lock().await.urls.remove(url)
    }

    pub async fn clear_urls(&self) {
        self.inner.state.lock().await.urls.clear();
    }

    pub async fn urls(&self) -> Vec<Uri> {
        self.inner.state.lock().await.urls.iter().cloned().collect()
    }

    /// Evaluate overall reachability against a snapshot of the targets.
    pub async fn check(&self) -> bool {
        let (addresses, urls) = {
            let state = self.inner.state.lock().await;
            (state.addresses.clone(), state.urls.clone())
        };
        self.inner.check_targets(&addresses, &urls).await
    }

    pub async fn check_address(&self, address: IpAddr) -> bool {
        self.inner.probe.probe_address(address).await
    }

    pub async fn check_url(&self, url: &Uri) -> bool {
        self.inner.probe.probe_url(url).await
    }

    /// Run one tick now, outside the schedule.
    pub async fn tick(&self) -> TickOutcome {
        self.inner.tick().await
    }

    pub fn is_started(&self) -> bool {
        self.scheduler.is_started()
    }

    /// Stop scheduled ticks. Components are left in their current state.
    ///
    /// Waits for a tick in progress to finish first.
    pub async fn stop(&self) {
        let _state = self.inner.state.lock().await;
        self.scheduler.stop();
        info!("network watchdog stopped");
    }

    /// Change the check period in milliseconds.
    ///
    /// Like [`stop`](Self::stop), this never overlaps a running tick.
    pub async fn set_period(&self, period_ms: i64) -> WatchdogResult<()> {
        let _state = self.inner.state.lock().await;
        Ok(self.scheduler.set_period(period_ms)?)
    }

    fn check_start(&self, state: &WatchdogState) -> WatchdogResult<()> {
        if !self.scheduler.is_started() && state.has_targets() && !state.components.is_empty() {
            self.scheduler.start()?;
            info!(
                addresses = state.addresses.len(),
                urls = state.urls.len(),
                components = state.components.len(),
                "network watchdog started"
            );
        }
        Ok(())
    }
}

/// Parse and validate a URL target.
pub fn parse_url(raw: &str) -> WatchdogResult<Uri> {
    let url: Uri = raw.trim().parse().map_err(|e: http::uri::InvalidUri| {
        WatchdogError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        }
    })?;
    validate_url(&url)?;
    Ok(url)
}

fn validate_url(url: &Uri) -> WatchdogResult<()> {
    match url.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(WatchdogError::UnsupportedScheme(other.to_string())),
        None => {
            return Err(WatchdogError::InvalidUrl {
                url: url.to_string(),
                reason: "missing scheme".to_string(),
            })
        }
    }
    if url.host().is_none_or(str::is_empty) {
        return Err(WatchdogError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

/// Resolve an IP literal or host name to a single address.
pub async fn resolve_address(host: &str) -> WatchdogResult<IpAddr> {
    let host = host.trim();
    if let Ok(address) = host.parse::<IpAddr>() {
        return Ok(address);
    }
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| WatchdogError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| WatchdogError::Resolve {
            host: host.to_string(),
            reason: "no addresses returned".to_string(),
        })
}
