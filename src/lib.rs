//! cloak-dns - DNS-over-HTTPS client transport
//!
//! Resolves raw DNS queries by POSTing them to a DoH endpoint (RFC 8484),
//! keeping the endpoint's server addresses in a preference order learned
//! from recent successes so lookups survive partial failure of the
//! endpoint's IP set. A DNS-over-TCP forwarder bridges a local stub
//! resolver onto the transport.
//!
//! Features:
//! - POST-only DoH over HTTP/2, with the query ID zeroed on the wire and
//!   restored on the response
//! - Per-host candidate address sets with a confirmed-good fast path and
//!   promote-on-success ordering
//! - Per-transaction telemetry through a listener interface
//! - RFC 1035 §4.2.2 length-prefixed TCP forwarding with one task per query
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloak_dns::{accept, DnsTransport, DohTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = DohTransport::new(
//!     "https://dns.google/dns-query",
//!     &["8.8.8.8".to_string(), "8.8.4.4".to_string()],
//!     None,
//! )
//! .await?;
//! let transport: Arc<dyn DnsTransport> = Arc::new(transport);
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5353").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     tokio::spawn(accept(transport.clone(), stream));
//! }
//! # }
//! ```

mod dialer;
pub mod error;
mod forwarder;
mod ipmap;
mod summary;
mod transport;

pub use dialer::{StreamDialer, TcpDialer};
pub use error::{Error, Result};
pub use forwarder::accept;
pub use ipmap::{IpMap, IpSet};
pub use summary::{DnsListener, DnsSummary, QueryStatus};
pub use transport::{DnsTransport, DohTransport};
