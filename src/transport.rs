//! The DoH transport: builds HTTPS POST requests for raw DNS queries and
//! drives them over a learned-preference connection to the endpoint.
//!
//! Queries travel with their ID zeroed (RFC 8484 §4.1 cache friendliness);
//! the original ID is restored on the way back so callers can keep
//! correlating by ID. Every transaction, successful or not, is summarized
//! to the registered listener.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::{self, SendRequest};
use hyper::header::{ACCEPT, CONTENT_TYPE, LOCATION, USER_AGENT};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls_pki_types::ServerName;
use tokio::sync::{broadcast, Mutex};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::dialer::{PreferredDialer, StreamDialer, TcpDialer};
use crate::error::{Error, Result};
use crate::ipmap::{IpMap, IpSet};
use crate::summary::{DnsListener, DnsSummary, QueryStatus};

const DOH_MIME: &str = "application/dns-message";
const AGENT: &str = "Intra";

/// Overall time limit for one query, connection establishment included.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Redirect hops followed before giving up with the server's status.
const MAX_REDIRECTS: usize = 3;

type Body = Full<Bytes>;

/// A DNS query transport.
///
/// The forwarder and other consumers depend only on this trait, never on a
/// concrete transport.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    /// Given a DNS query (including its ID), returns a DNS response with a
    /// matching ID, or an error if no response was received. The caller's
    /// buffer is never modified.
    async fn query(&self, q: &[u8]) -> Result<Vec<u8>>;

    /// The server URL this transport was built with, verbatim.
    fn url(&self) -> &str;
}

/// One established HTTP/2 connection and the address behind it.
struct H2Conn {
    sender: SendRequest<Body>,
    server: IpAddr,
}

/// POST-only DNS-over-HTTPS transport (RFC 8484).
pub struct DohTransport {
    url: String,
    endpoint: Url,
    uri: Uri,
    domain: String,
    port: u16,
    ips: Arc<IpSet>,
    dialer: PreferredDialer,
    tls: TlsConnector,
    conn: Mutex<Option<H2Conn>>,
    listener: Option<Arc<dyn DnsListener>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for DohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohTransport")
            .field("url", &self.url)
            .field("domain", &self.domain)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl DohTransport {
    /// Build a transport for `url`, resolving the URL host and every entry
    /// of `fallbacks` (domain names or IP literals) into the candidate set.
    ///
    /// Fails when the URL does not parse, the scheme is not `https`, or no
    /// candidate address could be found at all.
    pub async fn new(
        url: &str,
        fallbacks: &[String],
        listener: Option<Arc<dyn DnsListener>>,
    ) -> Result<Self> {
        Self::build(url, fallbacks, listener, None, Arc::new(TcpDialer::new())).await
    }

    /// Like [`DohTransport::new`], but candidate addresses are shared with
    /// other transports through `map`, so endpoints for the same hostname
    /// pool what they learn.
    pub async fn with_ip_map(
        url: &str,
        fallbacks: &[String],
        listener: Option<Arc<dyn DnsListener>>,
        map: &IpMap,
    ) -> Result<Self> {
        Self::build(url, fallbacks, listener, Some(map), Arc::new(TcpDialer::new())).await
    }

    /// Like [`DohTransport::new`], with a caller-supplied stream dialer
    /// (for example one that performs TCP-level retries).
    pub async fn with_stream_dialer(
        url: &str,
        fallbacks: &[String],
        listener: Option<Arc<dyn DnsListener>>,
        dialer: Arc<dyn StreamDialer>,
    ) -> Result<Self> {
        Self::build(url, fallbacks, listener, None, dialer).await
    }

    async fn build(
        url: &str,
        fallbacks: &[String],
        listener: Option<Arc<dyn DnsListener>>,
        map: Option<&IpMap>,
        stream_dialer: Arc<dyn StreamDialer>,
    ) -> Result<Self> {
        let endpoint = Url::parse(url)?;
        if endpoint.scheme() != "https" {
            return Err(Error::BadScheme(endpoint.scheme().to_string()));
        }
        let domain = endpoint
            .host_str()
            .ok_or_else(|| Error::Internal("server URL has no host".to_string()))?
            .to_string();
        let port = endpoint.port().unwrap_or(443);

        // URL host addresses first, then the fallbacks, deduplicated.
        // Resolver failures are tolerated; only total emptiness is fatal.
        let ips = match map {
            Some(map) => map.get(&domain).await,
            None => {
                let set = Arc::new(IpSet::new());
                set.add(&domain).await;
                set
            }
        };
        for fallback in fallbacks {
            ips.add(fallback).await;
        }
        if ips.is_empty() {
            return Err(Error::NoAddresses(domain));
        }

        let uri: Uri = url
            .parse()
            .map_err(|e| Error::Internal(format!("unusable server URL: {e}")))?;
        let tls = TlsConnector::from(Arc::new(tls_config()?));
        let (shutdown_tx, _) = broadcast::channel(1);

        log::info!(
            "DoH transport for {url} with {} candidate addresses",
            ips.ordered().len()
        );

        Ok(Self {
            url: url.to_string(),
            endpoint,
            uri,
            dialer: PreferredDialer::new(domain.clone(), port, ips.clone(), stream_dialer),
            domain,
            port,
            ips,
            tls,
            conn: Mutex::new(None),
            listener,
            shutdown_tx,
        })
    }

    /// Cancel all in-flight queries; each reports `Canceled`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Dial, perform the TLS and HTTP/2 handshakes, and spawn the
    /// connection driver. The peer address is captured here, at connection
    /// establishment, before any request completes.
    async fn open_connection(&self, host: &str, port: u16) -> Result<H2Conn> {
        let (tcp, server) = self
            .dialer
            .connect(host, port)
            .await
            .map_err(|e| Error::SendFailed(format!("connect to {host} failed: {e}")))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::SendFailed(format!("invalid server name {host}: {e}")))?;
        let tls = self.tls.connect(server_name, tcp).await.map_err(|e| {
            self.ips.disconfirm(server);
            Error::SendFailed(format!("TLS handshake with {server} failed: {e}"))
        })?;
        if tls.get_ref().1.alpn_protocol() != Some(&b"h2"[..]) {
            self.ips.disconfirm(server);
            return Err(Error::SendFailed(format!(
                "{host} did not negotiate HTTP/2"
            )));
        }

        let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
            .await
            .map_err(|e| Error::SendFailed(format!("HTTP/2 handshake with {server} failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("connection to {server} closed: {e}");
            }
        });

        log::debug!("connected to {host} via {server}");
        Ok(H2Conn { sender, server })
    }

    /// Hand out the pooled connection, re-establishing it when it has died.
    /// Concurrent queries multiplex over the same HTTP/2 connection.
    async fn checkout(&self) -> Result<(SendRequest<Body>, IpAddr)> {
        let cached = {
            let guard = self.conn.lock().await;
            guard.as_ref().map(|c| (c.sender.clone(), c.server))
        };
        if let Some((mut sender, server)) = cached {
            if sender.ready().await.is_ok() {
                return Ok((sender, server));
            }
        }

        let conn = self.open_connection(&self.domain, self.port).await?;
        let out = (conn.sender.clone(), conn.server);
        *self.conn.lock().await = Some(conn);
        Ok(out)
    }

    fn build_request(&self, uri: &Uri, body: Vec<u8>) -> Result<Request<Body>> {
        Request::builder()
            .method(Method::POST)
            .uri(uri.clone())
            .header(CONTENT_TYPE, DOH_MIME)
            .header(ACCEPT, DOH_MIME)
            .header(USER_AGENT, AGENT)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Internal(format!("request build failed: {e}")))
    }

    async fn send(
        &self,
        sender: &mut SendRequest<Body>,
        req: Request<Body>,
    ) -> Result<Response<hyper::body::Incoming>> {
        sender
            .ready()
            .await
            .map_err(|e| Error::SendFailed(format!("connection not ready: {e}")))?;
        sender
            .send_request(req)
            .await
            .map_err(|e| Error::SendFailed(format!("request failed: {e}")))
    }

    /// POST `wire` to the endpoint and return the response body. `server`
    /// is updated at every connection acquisition, so the caller learns the
    /// peer address even when the request itself fails.
    async fn exchange(&self, wire: &[u8], server: &mut String) -> Result<Vec<u8>> {
        let (mut sender, ip) = self.checkout().await?;
        *server = ip.to_string();

        let req = self.build_request(&self.uri, wire.to_vec())?;
        let mut response = match self.send(&mut sender, req).await {
            Ok(r) => r,
            Err(e) => {
                // A dead pooled connection disqualifies its address; the
                // next query redials.
                self.ips.disconfirm(ip);
                self.conn.lock().await.take();
                return Err(e);
            }
        };

        // Redirects re-POST to the new location. A foreign host goes
        // through the dialer's direct path, without preference learning.
        let mut current = self.endpoint.clone();
        let mut hops = 0;
        while response.status().is_redirection() {
            let status = response.status();
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(Error::Http(status));
            }
            let location = match response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                Some(l) => l.to_string(),
                None => return Err(Error::Http(status)),
            };
            let _ = response.into_body().collect().await;

            current = current.join(&location)?;
            if current.scheme() != "https" {
                return Err(Error::BadScheme(current.scheme().to_string()));
            }
            let host = current
                .host_str()
                .ok_or_else(|| Error::Internal("redirect target has no host".to_string()))?
                .to_string();
            let port = current.port().unwrap_or(443);
            let uri: Uri = current
                .as_str()
                .parse()
                .map_err(|e| Error::Internal(format!("unusable redirect target: {e}")))?;
            log::debug!("following redirect to {current}");

            // One-shot connection; redirect targets are not pooled.
            let mut conn = self.open_connection(&host, port).await?;
            *server = conn.server.to_string();
            let req = self.build_request(&uri, wire.to_vec())?;
            response = self.send(&mut conn.sender, req).await?;
        }

        let status = response.status();
        if status != StatusCode::OK {
            // Drain the unused body before reporting.
            let _ = response.into_body().collect().await;
            return Err(Error::Http(status));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::SendFailed(format!("failed to read response: {e}")))?
            .to_bytes();
        Ok(body.to_vec())
    }

    /// Scrub the query ID for the wire and restore it on the response.
    /// Works on a private copy; the caller's bytes stay untouched on every
    /// path.
    async fn do_query(&self, q: &[u8], server: &mut String) -> Result<Vec<u8>> {
        if q.len() < 2 {
            return Err(Error::BadQuery(q.len()));
        }
        let (id0, id1) = (q[0], q[1]);
        let mut wire = q.to_vec();
        wire[0] = 0;
        wire[1] = 0;

        let mut response = self.exchange(&wire, server).await?;
        // Re-pair the response with the original query ID. Anything shorter
        // than an ID is returned verbatim.
        if response.len() >= 2 {
            response[0] = id0;
            response[1] = id1;
        }
        Ok(response)
    }
}

#[async_trait]
impl DnsTransport for DohTransport {
    async fn query(&self, q: &[u8]) -> Result<Vec<u8>> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let start = Instant::now();
        let mut server = String::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let result = tokio::select! {
            r = tokio::time::timeout(QUERY_TIMEOUT, self.do_query(q, &mut server)) => match r {
                Ok(r) => r,
                Err(_) => Err(Error::SendFailed("query timed out".to_string())),
            },
            _ = shutdown_rx.recv() => Err(Error::Canceled),
        };
        let latency = start.elapsed();

        if let Some(listener) = &self.listener {
            let status = match &result {
                Ok(_) => QueryStatus::Complete,
                Err(e) => e.status(),
            };
            let response = match &result {
                Ok(r) => r.clone(),
                Err(_) => Vec::new(),
            };
            listener.on_dns_transaction(&DnsSummary {
                timestamp,
                latency,
                query: q.to_vec(),
                response,
                server: server.clone(),
                status,
            });
        }
        result
    }

    fn url(&self) -> &str {
        &self.url
    }
}

fn tls_config() -> Result<rustls::ClientConfig> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Internal(format!("failed to create TLS config: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    // RFC 8484 servers speak HTTP/2.
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}
