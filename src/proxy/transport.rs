//! Proxy transport layer for HTTP and SOCKS5 candidates
//!
//! A [`TransportBuilder`] turns `(endpoint, protocol)` into a [`Dialer`] that can
//! issue GET requests through that candidate. Dialers own every connection
//! they open and tear them down on [`Dialer::release`].

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, ACCEPT_LANGUAGE, CONNECTION, HOST, LOCATION, USER_AGENT};
use http_body_util::{BodyExt, Full, Limited};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Url};

use crate::error::{Result, ScanError};
use crate::models::{format_authority, Endpoint, Protocol};
use crate::proxy::dial::{self, BoxedStream};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Response collected through a dialer
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    /// `Location` header, kept for redirect handling
    pub location: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16, body: Bytes) -> Self {
        Self {
            status,
            body,
            location: None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.location.is_some()
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Capability to issue requests through one candidate with one protocol
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Issue a GET for `url` and collect the whole response
    async fn get(&self, url: &Url) -> Result<HttpResponse>;

    /// Close every connection this dialer owns
    ///
    /// Must be idempotent.
    fn release(&self);
}

/// Produces dialers bound to a protocol
pub trait TransportBuilder: Send + Sync {
    fn build(&self, endpoint: &Endpoint, protocol: Protocol) -> Result<Box<dyn Dialer>>;
}

/// Exclusive owner of a dialer
///
/// Releases the dialer exactly once, either explicitly or on drop.
pub struct DialerGuard {
    protocol: Protocol,
    inner: Option<Box<dyn Dialer>>,
}

impl DialerGuard {
    pub fn new(protocol: Protocol, dialer: Box<dyn Dialer>) -> Self {
        Self {
            protocol,
            inner: Some(dialer),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    pub async fn get(&self, url: &Url) -> Result<HttpResponse> {
        match &self.inner {
            Some(dialer) => dialer.get(url).await,
            None => Err(ScanError::DialerReleased),
        }
    }

    pub fn release(&mut self) {
        if let Some(dialer) = self.inner.take() {
            dialer.release();
        }
    }
}

impl Drop for DialerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DialerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialerGuard")
            .field("protocol", &self.protocol)
            .field("released", &self.is_released())
            .finish()
    }
}

/// How a [`TunnelDialer`] reaches its targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Http(String),
    Socks5(String),
}

/// Dialer that tunnels through a real candidate proxy
pub struct TunnelDialer {
    route: Route,
    tls: TlsConnector,
    user_agent: String,
    body_limit: Option<usize>,
    connections: Mutex<Vec<JoinHandle<()>>>,
    released: AtomicBool,
}

impl TunnelDialer {
    pub fn new(route: Route, tls: TlsConnector, user_agent: impl Into<String>) -> Self {
        Self {
            route,
            tls,
            user_agent: user_agent.into(),
            body_limit: None,
            connections: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Dialer that connects to targets without any proxy
    pub fn direct(tls: TlsConnector) -> Self {
        Self::new(Route::Direct, tls, DEFAULT_USER_AGENT)
    }

    /// Fail any response whose body grows past `limit` bytes
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = Some(limit);
        self
    }

    /// Open a stream able to carry a request for `target`
    ///
    /// Returns whether the request must use absolute-form (plain HTTP forwarding).
    async fn open(&self, target: &Target) -> anyhow::Result<(BoxedStream, bool)> {
        let host = target.host.as_str();
        let port = target.port;

        match (&self.route, target.tls) {
            (Route::Http(proxy), false) => {
                let stream = tokio::net::TcpStream::connect(proxy.as_str()).await?;
                Ok((Box::new(stream), true))
            }
            (Route::Http(proxy), true) => {
                let stream = dial::connect_via_http_proxy(proxy, host, port).await?;
                let tls = dial::wrap_tls(&self.tls, host, stream).await?;
                Ok((Box::new(tls), false))
            }
            (Route::Socks5(proxy), tls) => {
                let stream = dial::connect_via_socks5_proxy(proxy, host, port).await?;
                if tls {
                    Ok((Box::new(dial::wrap_tls(&self.tls, host, stream).await?), false))
                } else {
                    Ok((Box::new(stream), false))
                }
            }
            (Route::Direct, tls) => {
                let stream = dial::connect_direct(host, port).await?;
                if tls {
                    Ok((Box::new(dial::wrap_tls(&self.tls, host, stream).await?), false))
                } else {
                    Ok((Box::new(stream), false))
                }
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut connections = self.connections.lock();
        connections.retain(|h| !h.is_finished());
        if self.released.load(Ordering::Acquire) {
            handle.abort();
        } else {
            connections.push(handle);
        }
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        if self.released.load(Ordering::Acquire) {
            return Err(ScanError::DialerReleased);
        }

        let target = Target::from_url(url)?;
        let (stream, absolute_form) = self
            .open(&target)
            .await
            .map_err(|e| ScanError::TunnelError(e.to_string()))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ScanError::TunnelError(format!("Handshake failed: {}", e)))?;

        self.track(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection ended: {}", e);
            }
        }));

        let uri = if absolute_form {
            url.as_str().to_string()
        } else {
            match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            }
        };

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, target.host_header())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/json,*/*;q=0.8",
            )
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(CONNECTION, "close")
            .body(Full::new(Bytes::new()))
            .map_err(|e| ScanError::Http(format!("Failed to build request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ScanError::Http(format!("Request failed: {}", e)))?;

        let (parts, body) = response.into_parts();
        let body = match self.body_limit {
            Some(limit) => Limited::new(body, limit)
                .collect()
                .await
                .map_err(|e| ScanError::Http(format!("Failed to read response: {}", e)))?
                .to_bytes(),
            None => body
                .collect()
                .await
                .map_err(|e| ScanError::Http(format!("Failed to read response: {}", e)))?
                .to_bytes(),
        };

        Ok(HttpResponse {
            status: parts.status.as_u16(),
            body,
            location: parts
                .headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        })
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TunnelDialer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Builds [`TunnelDialer`]s for candidate endpoints
#[derive(Clone)]
pub struct TunnelBuilder {
    tls: TlsConnector,
    user_agent: String,
}

impl TunnelBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self::with_connector(dial::tls_connector()?))
    }

    pub fn with_connector(tls: TlsConnector) -> Self {
        Self {
            tls,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn connector(&self) -> TlsConnector {
        self.tls.clone()
    }
}

impl TransportBuilder for TunnelBuilder {
    fn build(&self, endpoint: &Endpoint, protocol: Protocol) -> Result<Box<dyn Dialer>> {
        let proxy_url = endpoint.url(protocol);
        let parsed = Url::parse(&proxy_url).map_err(|e| ScanError::BuildError {
            protocol,
            reason: format!("invalid proxy URL '{}': {}", proxy_url, e),
        })?;
        if parsed.host().is_none() || parsed.port().is_none() {
            return Err(ScanError::BuildError {
                protocol,
                reason: format!("proxy URL '{}' lacks host or port", proxy_url),
            });
        }

        let authority = endpoint.identity();
        let route = match protocol {
            Protocol::Http => Route::Http(authority),
            Protocol::Socks5 => Route::Socks5(authority),
        };

        Ok(Box::new(TunnelDialer::new(
            route,
            self.tls.clone(),
            self.user_agent.clone(),
        )))
    }
}

/// Request target split out of a URL
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    tls: bool,
}

impl Target {
    fn from_url(url: &Url) -> Result<Self> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ScanError::InvalidConfig(format!(
                    "unsupported target scheme '{}'",
                    other
                )))
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(ScanError::InvalidConfig(format!(
                    "target URL '{}' has no host",
                    url
                )))
            }
        };

        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });

        Ok(Self { host, port, tls })
    }

    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            format_authority(&self.host, self.port)
        }
    }
}
