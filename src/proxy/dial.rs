//! Low-level dialing helpers
//!
//! Opens raw streams either directly or through a candidate proxy, and wraps
//! them in TLS when the target is HTTPS.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;

use crate::error::{Result, ScanError};
use crate::models::format_authority;

/// Largest CONNECT response head we are willing to buffer
const MAX_CONNECT_HEAD: usize = 8 * 1024;

/// Any byte stream a request can be written to
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Build a TLS connector trusting the webpki root set
pub fn tls_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ScanError::InvalidConfig(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

pub async fn connect_direct(host: &str, port: u16) -> anyhow::Result<TcpStream> {
    Ok(TcpStream::connect(format_authority(host, port)).await?)
}

/// Open a CONNECT tunnel through an HTTP proxy
pub async fn connect_via_http_proxy(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    let authority = format_authority(target_host, target_port);
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
        authority, authority
    );
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    let head = String::from_utf8_lossy(&head);
    if !head.starts_with("HTTP/1.1 200") && !head.starts_with("HTTP/1.0 200") {
        anyhow::bail!(
            "CONNECT failed: {}",
            head.lines().next().unwrap_or("Unknown error")
        );
    }

    Ok(stream)
}

/// Open a SOCKS5 tunnel (no authentication)
pub async fn connect_via_socks5_proxy(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> anyhow::Result<TcpStream> {
    let socket = TcpStream::connect(proxy_addr).await?;
    let stream = Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?;
    Ok(stream.into_inner())
}

/// Run a TLS handshake with `host` over an established stream
pub async fn wrap_tls<S>(
    connector: &TlsConnector,
    host: &str,
    stream: S,
) -> anyhow::Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())?;
    Ok(connector.connect(server_name, stream).await?)
}

/// Read until the blank line ending a response head
///
/// Bytes after the head are not expected on a fresh CONNECT tunnel.
async fn read_response_head(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    let mut buf = [0u8; 512];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            if head.is_empty() {
                anyhow::bail!("empty CONNECT response");
            }
            anyhow::bail!("connection closed inside CONNECT response");
        }
        head.extend_from_slice(&buf[..n]);

        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_CONNECT_HEAD {
            anyhow::bail!("oversized CONNECT response");
        }
    }
}
