// A one-shot HTTP round-tripper over a single connection. NTLM binds its
// handshake to a TCP connection, so the usual pooled clients can't be used
// for the challenge dance; this owns the connection outright, and for
// CONNECT the caller hijacks it once the tunnel is established.
use crate::parse::{read_body, read_response_head};
use anyhow::{anyhow, bail, Context as _, Result};
use bytes::BytesMut;
use http::header::{HeaderMap, CONTENT_LENGTH, HOST};
use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide TLS client configuration, built once at first use. Only
/// startup code may influence it (by installing a crypto provider).
static TLS_CONNECTOR: Lazy<tokio_rustls::TlsConnector> = Lazy::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
});

/// The upstream side of a connection: plain TCP, or TLS for HTTPS proxy
/// directives. Both variants are Unpin, which keeps the poll delegation
/// below trivial.
pub enum UpstreamStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => std::pin::Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A request in wire form. `target` is written to the request line exactly
/// as given: authority-form for CONNECT, absolute-form when talking to a
/// proxy, origin-form when talking to an origin server.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn new(method: &str, target: &str) -> Self {
        RawRequest {
            method: method.to_string(),
            target: target.to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.target).as_bytes());
        // Write Host first; some proxies are picky about it.
        if let Some(host) = self.headers.get(HOST) {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for (name, value) in &self.headers {
            if name == HOST {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() && !self.headers.contains_key(CONTENT_LENGTH) {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct Transport {
    stream: Option<UpstreamStream>,
    buf: BytesMut,
}

impl Transport {
    pub fn new() -> Self {
        Transport::default()
    }

    /// Dials `authority`, replacing any existing connection. With `tls`
    /// set the connection is wrapped in TLS using the process-wide client
    /// config (HTTPS proxy directives).
    pub async fn dial(&mut self, authority: &str, tls: bool) -> Result<()> {
        self.stream = None;
        self.buf.clear();
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(authority))
            .await
            .map_err(|_| anyhow!("timed out dialling {}", authority))?
            .with_context(|| format!("error dialling {}", authority))?;
        if tls {
            let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority);
            let name = ServerName::try_from(host.to_string())
                .with_context(|| format!("invalid TLS server name: {}", host))?;
            let stream =
                tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, TLS_CONNECTOR.connect(name, tcp))
                    .await
                    .map_err(|_| anyhow!("TLS handshake with {} timed out", authority))?
                    .with_context(|| format!("TLS handshake with {} failed", authority))?;
            self.stream = Some(UpstreamStream::Tls(Box::new(stream)));
        } else {
            self.stream = Some(UpstreamStream::Tcp(tcp));
        }
        Ok(())
    }

    /// Sends one request and reads one response, including its body.
    pub async fn round_trip(&mut self, req: &RawRequest) -> Result<RawResponse> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("no connection, can't send request"))?;
        stream.write_all(&req.to_bytes()).await?;
        stream.flush().await?;
        let head = read_response_head(stream, &mut self.buf).await?;
        let body = if req.method == "CONNECT" && (200..300).contains(&head.status) {
            // A successful CONNECT response has no body; whatever follows
            // belongs to the tunnel.
            Vec::new()
        } else {
            read_body(stream, &mut self.buf, &head.headers).await?
        };
        Ok(RawResponse {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body,
        })
    }

    /// Takes ownership of the connection away from the transport, plus any
    /// bytes already read past the last response head.
    pub fn hijack(&mut self) -> Result<(UpstreamStream, BytesMut)> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow!("no connection to hijack"))?;
        Ok((stream, std::mem::take(&mut self.buf)))
    }

    pub fn close(&mut self) {
        self.stream = None;
        self.buf.clear();
    }
}
