//! Watchdog configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `NETWATCH_*` environment variables. The daemon applies its CLI flags on
//! top of the result.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default tick cadence in milliseconds.
pub const DEFAULT_CHECK_PERIOD_MS: u64 = 5000;
/// Default per-tier address probe timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// Default URL probe timeout in milliseconds.
pub const DEFAULT_URL_TIMEOUT_MS: u64 = 5000;

pub const ENV_INTERFACE: &str = "NETWATCH_INTERFACE";
pub const ENV_CHECK_PERIOD: &str = "NETWATCH_CHECK_PERIOD";
pub const ENV_TIMEOUT: &str = "NETWATCH_TIMEOUT";
pub const ENV_URL_TIMEOUT: &str = "NETWATCH_URL_TIMEOUT";
pub const ENV_ADDRESS_LIST: &str = "NETWATCH_ADDRESS_LIST";
pub const ENV_URL_LIST: &str = "NETWATCH_URL_LIST";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Local network interface probes are bound to.
    pub interface: Option<String>,
    pub check_period_ms: u64,
    pub timeout_ms: u64,
    pub url_timeout_ms: u64,
    /// Addresses to probe, as IP literals or host names.
    pub addresses: Vec<String>,
    pub urls: Vec<String>,
    /// Fall back to the `ping` executable when the native probe fails.
    pub ping_fallback: bool,
    pub ping_command: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interface: None,
            check_period_ms: DEFAULT_CHECK_PERIOD_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            url_timeout_ms: DEFAULT_URL_TIMEOUT_MS,
            addresses: Vec::new(),
            urls: Vec::new(),
            ping_fallback: true,
            ping_command: "ping".to_string(),
        }
    }
}

impl WatchdogConfig {
    /// Load a config from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable lookup.
    ///
    /// Unset variables leave the current value untouched. The address and
    /// URL lists are comma separated; blank items are ignored.
    pub fn apply_vars<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(nic) = lookup(ENV_INTERFACE) {
            let nic = nic.trim();
            self.interface = (!nic.is_empty()).then(|| nic.to_string());
        }
        if let Some(v) = lookup(ENV_CHECK_PERIOD) {
            self.check_period_ms = parse_millis(ENV_CHECK_PERIOD, &v)?;
        }
        if let Some(v) = lookup(ENV_TIMEOUT) {
            self.timeout_ms = parse_millis(ENV_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_URL_TIMEOUT) {
            self.url_timeout_ms = parse_millis(ENV_URL_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_ADDRESS_LIST) {
            self.addresses = split_list(&v);
        }
        if let Some(v) = lookup(ENV_URL_LIST) {
            self.urls = split_list(&v);
        }
        Ok(())
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn url_timeout(&self) -> Duration {
        Duration::from_millis(self.url_timeout_ms)
    }
}

fn parse_millis(key: &str, value: &str) -> ConfigResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Split a comma-separated list, trimming items and dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
