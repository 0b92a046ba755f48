//! Reachability probes.
//!
//! Address probes run in two tiers. Tier 1 is a TCP connect to the echo
//! port of the target, bound to the configured interface; a completed or
//! actively refused connection both prove the host is up. Tier 2 runs only
//! when tier 1 did not succeed and shells out to `ping`, for hosts that
//! drop TCP but answer ICMP.
//!
//! URL probes perform an HTTP/1.1 GET and read the whole response body
//! within an explicit timeout.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::Uri;
use http_body_util::{BodyExt, Empty};
use tokio::net::{TcpSocket, TcpStream};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use netwatch_core::{BoxFuture, WatchdogConfig};

/// TCP echo service port used by the native probe.
const ECHO_PORT: u16 = 7;

/// Strategy used by the watchdog to test a single target.
pub trait ReachabilityProbe: Send + Sync {
    fn probe_address(&self, address: IpAddr) -> BoxFuture<'_, bool>;

    fn probe_url<'a>(&'a self, url: &'a Uri) -> BoxFuture<'a, bool>;
}

/// Probes real network targets.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    /// Interface native probes bind to, already validated.
    interface: Option<String>,
    timeout: Duration,
    url_timeout: Duration,
    /// `ping` executable for the tier-2 fallback; `None` disables it.
    ping_command: Option<String>,
}

impl NetworkProbe {
    pub fn new(timeout: Duration, url_timeout: Duration) -> Self {
        Self {
            interface: None,
            timeout,
            url_timeout,
            ping_command: Some("ping".to_string()),
        }
    }

    /// Build a probe from a watchdog config, validating the interface.
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            interface: resolve_interface(config.interface.as_deref()),
            timeout: config.timeout(),
            url_timeout: config.url_timeout(),
            ping_command: config
                .ping_fallback
                .then(|| config.ping_command.clone()),
        }
    }

    pub fn with_ping_command(mut self, command: Option<String>) -> Self {
        self.ping_command = command;
        self
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Two-tier address probe. Never fails; errors count as unreachable.
    pub async fn check_address(&self, address: IpAddr) -> bool {
        match self.native_probe(address).await {
            Ok(true) => {
                trace!(%address, "address reachable");
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!(%address, error = %e, "native reachability probe failed"),
        }

        let Some(command) = &self.ping_command else {
            return false;
        };
        match self.ping_probe(command, address).await {
            Ok(reachable) => reachable,
            Err(e) => {
                warn!(%address, %command, error = %e, "ping probe failed");
                false
            }
        }
    }

    /// Connect to `url` and read the full response.
    pub async fn check_url(&self, url: &Uri) -> bool {
        match tokio::time::timeout(self.url_timeout, fetch(url)).await {
            Ok(Ok(())) => {
                trace!(%url, "url reachable");
                true
            }
            Ok(Err(e)) => {
                debug!(%url, error = %e, "url probe failed");
                false
            }
            Err(_) => {
                debug!(%url, "url probe timed out");
                false
            }
        }
    }

    async fn native_probe(&self, address: IpAddr) -> io::Result<bool> {
        let socket = match address {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        self.bind_interface(&socket)?;

        let target = SocketAddr::new(address, ECHO_PORT);
        match tokio::time::timeout(self.timeout, socket.connect(target)).await {
            Ok(Ok(_stream)) => Ok(true),
            // The host answered with a reset, so it is up.
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(true),
            Ok(Err(e)) => {
                debug!(%address, error = %e, "native probe unreachable");
                Ok(false)
            }
            Err(_) => {
                debug!(%address, "native probe timed out");
                Ok(false)
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
    fn bind_interface(&self, socket: &TcpSocket) -> io::Result<()> {
        if let Some(nic) = &self.interface {
            socket.bind_device(Some(nic.as_bytes()))?;
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
    fn bind_interface(&self, _socket: &TcpSocket) -> io::Result<()> {
        Ok(())
    }

    async fn ping_probe(&self, command: &str, address: IpAddr) -> io::Result<bool> {
        let secs = ping_timeout_secs(self.timeout);
        let mut cmd = Command::new(command);
        cmd.args(ping_args(secs, address))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(Duration::from_secs(secs + 1), cmd.output()).await
        {
            Ok(output) => output?,
            Err(_) => {
                debug!(%address, "ping timed out");
                return Ok(false);
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            trace!(%address, "{line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!(%address, "{line}");
        }

        Ok(output.status.success())
    }
}

impl ReachabilityProbe for NetworkProbe {
    fn probe_address(&self, address: IpAddr) -> BoxFuture<'_, bool> {
        Box::pin(self.check_address(address))
    }

    fn probe_url<'a>(&'a self, url: &'a Uri) -> BoxFuture<'a, bool> {
        Box::pin(self.check_url(url))
    }
}

/// Whole seconds handed to `ping`, at least one.
pub fn ping_timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

fn ping_args(secs: u64, address: IpAddr) -> Vec<String> {
    let address = address.to_string();
    if cfg!(windows) {
        let millis = (secs * 1000).to_string();
        vec!["-n".into(), "1".into(), "-w".into(), millis, address]
    } else if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )) {
        vec!["-c".into(), "1".into(), "-t".into(), secs.to_string(), address]
    } else {
        vec!["-c".into(), "1".into(), "-W".into(), secs.to_string(), address]
    }
}

/// Validate an interface name by binding a throwaway socket to it.
///
/// Any failure degrades to no binding.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
pub fn resolve_interface(name: Option<&str>) -> Option<String> {
    let name = name?;
    let bound = TcpSocket::new_v4().and_then(|socket| socket.bind_device(Some(name.as_bytes())));
    match bound {
        Ok(()) => {
            debug!(interface = %name, "probes bound to interface");
            Some(name.to_string())
        }
        Err(e) => {
            warn!(interface = %name, error = %e, "cannot bind to interface, probing unbound");
            None
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
pub fn resolve_interface(name: Option<&str>) -> Option<String> {
    if let Some(name) = name {
        warn!(interface = %name, "interface binding unsupported on this platform, probing unbound");
    }
    None
}

async fn fetch(url: &Uri) -> anyhow::Result<()> {
    let authority = url
        .authority()
        .ok_or_else(|| anyhow!("url has no host"))?;
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let port = authority.port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host, port)).await?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = url.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, authority.as_str())
        .header(USER_AGENT, "netwatch/0.1")
        .body(Empty::<Bytes>::new())?;

    let resp = sender.send_request(req).await?;
    let status = resp.status();
    if status.is_client_error() || status.is_server_error() {
        bail!("endpoint answered {status}");
    }
    resp.into_body().collect().await?;
    Ok(())
}
