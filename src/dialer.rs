//! Connection establishment against the endpoint's candidate addresses.
//!
//! The transport never dials a hostname directly: the configured DoH host
//! goes through its [`IpSet`] preference list, one candidate at a time, and
//! a successful candidate is rotated to the front so later connections try
//! it first. Any other host (a redirect target) is resolved and dialed
//! directly, with no preference learning.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::ipmap::IpSet;

/// Default per-attempt connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a byte stream to a single address.
///
/// This is the seam for dialers with their own connection strategy (for
/// example a TCP-level retry dialer); the contract is only "given an
/// address, return a connected stream or fail".
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain TCP dialer with a per-attempt connect timeout.
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamDialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }
}

/// Dials the configured DoH host through its preference list.
pub(crate) struct PreferredDialer {
    domain: String,
    port: u16,
    ips: Arc<IpSet>,
    dialer: Arc<dyn StreamDialer>,
}

impl PreferredDialer {
    pub fn new(
        domain: String,
        port: u16,
        ips: Arc<IpSet>,
        dialer: Arc<dyn StreamDialer>,
    ) -> Self {
        Self {
            domain,
            port,
            ips,
            dialer,
        }
    }

    /// Connect to `host:port`. The configured domain goes through the
    /// preference list; any other host is resolved and dialed directly.
    pub async fn connect(&self, host: &str, port: u16) -> io::Result<(TcpStream, IpAddr)> {
        if host == self.domain {
            self.connect_preferred().await
        } else {
            self.connect_direct(host, port).await
        }
    }

    /// Walk the preference list sequentially, starting with the confirmed
    /// address when one is set. The winning candidate moves to the front.
    async fn connect_preferred(&self) -> io::Result<(TcpStream, IpAddr)> {
        let mut failed_hint = None;
        let mut last_err = None;
        if let Some(ip) = self.ips.confirmed() {
            match self.dialer.dial(SocketAddr::new(ip, self.port)).await {
                Ok(stream) => {
                    self.ips.promote(ip);
                    return Ok((stream, ip));
                }
                Err(e) => {
                    log::debug!("confirmed address {ip} failed: {e}");
                    self.ips.disconfirm(ip);
                    failed_hint = Some(ip);
                    last_err = Some(e);
                }
            }
        }

        for ip in self.ips.ordered() {
            if Some(ip) == failed_hint {
                continue;
            }
            match self.dialer.dial(SocketAddr::new(ip, self.port)).await {
                Ok(stream) => {
                    self.ips.promote(ip);
                    self.ips.confirm(&ip.to_string());
                    return Ok((stream, ip));
                }
                Err(e) => {
                    log::debug!("candidate {ip}:{} failed: {e}", self.port);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no reachable addresses for {}", self.domain),
            )
        }))
    }

    /// Resolve `host` with the system resolver and dial the results in
    /// order. Used for hosts other than the configured domain.
    async fn connect_direct(&self, host: &str, port: u16) -> io::Result<(TcpStream, IpAddr)> {
        let mut last_err = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            match self.dialer.dial(addr).await {
                Ok(stream) => return Ok((stream, addr.ip())),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses for {host}"),
            )
        }))
    }
}
