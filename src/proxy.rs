// The proxy engine: accepts client connections, classifies each request
// (CONNECT tunnel, absolute-form forward, or a request addressed to us),
// scrubs hop-by-hop headers, and retries with NTLM when an upstream proxy
// answers 407.
use crate::auth::Authenticator;
use crate::context::next_request_id;
use crate::hosts::HostAliases;
use crate::parse::{read_body, read_request_head, RequestHead};
use crate::pacwrapper::{PacWrapper, PAC_CONTENT_TYPE, PAC_PATH};
use crate::proxyfinder::{ProxyDirective, ProxyFinder};
use crate::transport::{RawRequest, RawResponse, Transport, UpstreamStream};
use anyhow::{anyhow, Context as _, Result};
use bytes::BytesMut;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TRANSFER_ENCODING, UPGRADE,
};
use http::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProxyServer {
    finder: Arc<ProxyFinder>,
    wrapper: Arc<PacWrapper>,
    auth: Option<Arc<Authenticator>>,
    aliases: Arc<HostAliases>,
    // One pooled client per upstream directive; reqwest clients are cheap
    // to clone and safe to share.
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ProxyServer {
    pub fn new(
        finder: Arc<ProxyFinder>,
        wrapper: Arc<PacWrapper>,
        auth: Option<Arc<Authenticator>>,
        aliases: Arc<HostAliases>,
    ) -> Arc<Self> {
        Arc::new(ProxyServer {
            finder,
            wrapper,
            auth,
            aliases,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!("Error accepting connection: {}", err);
                    continue;
                }
            };
            tracing::debug!("New connection from {}", client_addr);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    tracing::debug!("Connection from {} closed: {:#}", client_addr, err);
                }
            });
        }
    }

    async fn handle_connection(&self, mut client: TcpStream) -> Result<()> {
        let id = next_request_id();
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let head = read_request_head(&mut client, &mut buf).await?;
        let (method, target) = (head.method.clone(), head.target.clone());
        self.finder.check_for_updates().await;
        let status = if head.method == "CONNECT" {
            self.handle_connect(id, head, client, buf).await?
        } else if head.target.contains("://") {
            self.handle_forward(id, head, client, buf).await?
        } else {
            self.handle_local(head, client).await?
        };
        tracing::info!("[{}] {} {} {}", id, status, method, target);
        Ok(())
    }

    /// Origin-form requests are addressed to us, not proxied. The only
    /// endpoint is the wrapped PAC.
    async fn handle_local(&self, head: RequestHead, mut client: TcpStream) -> Result<u16> {
        let path = head.target.split('?').next().unwrap_or("");
        if path != PAC_PATH {
            return write_simple_response(&mut client, StatusCode::NOT_FOUND, &HeaderMap::new(), b"").await;
        }
        if head.method != "GET" {
            return write_simple_response(
                &mut client,
                StatusCode::METHOD_NOT_ALLOWED,
                &HeaderMap::new(),
                b"",
            )
            .await;
        }
        let pac = self.wrapper.pac();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PAC_CONTENT_TYPE));
        write_simple_response(&mut client, StatusCode::OK, &headers, pac.as_bytes()).await
    }

    // ─── Plain forwarding (absolute-form, non-CONNECT) ───────────────────

    async fn handle_forward(
        &self,
        id: u64,
        mut head: RequestHead,
        mut client: TcpStream,
        mut buf: BytesMut,
    ) -> Result<u16> {
        let Ok(url) = Url::parse(&head.target) else {
            return write_simple_response(&mut client, StatusCode::BAD_REQUEST, &HeaderMap::new(), b"")
                .await;
        };
        delete_request_headers(&mut head.headers);
        // The body is buffered in full below, so a client waiting on
        // 100-continue would deadlock with us; tell it to go ahead.
        if let Some(expect) = head.headers.remove(http::header::EXPECT) {
            if expect.as_bytes().eq_ignore_ascii_case(b"100-continue") {
                client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            }
        }
        // Buffer the whole body so it can be replayed if authentication is
        // needed.
        let body = match read_body(&mut client, &mut buf, &head.headers).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("[{}] Error reading request body: {:#}", id, err);
                return write_simple_response(
                    &mut client,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &HeaderMap::new(),
                    b"",
                )
                .await;
            }
        };
        let directive = match self.finder.find_proxy_for_request(id, &head.method, &url).await {
            Ok(directive) => directive,
            Err(err) => {
                tracing::warn!("[{}] Error finding proxy for {}: {:#}", id, url, err);
                return write_simple_response(
                    &mut client,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &HeaderMap::new(),
                    b"",
                )
                .await;
            }
        };

        match self.forward_once(&head, &url, body.clone(), &directive).await {
            Ok(resp) if resp.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED
                && self.auth.is_some() =>
            {
                // Replay the buffered request through a raw transport so
                // the NTLM dance stays on a single connection.
                match self.replay_with_auth(id, &head, &url, body, &directive).await {
                    Ok(raw) => relay_raw_response(&mut client, raw).await,
                    Err(ReplayError::ProxyConnect(authority, err)) => {
                        tracing::warn!("[{}] Error dialling {}: {:#}", id, authority, err);
                        self.finder.block_proxy(&authority);
                        write_simple_response(
                            &mut client,
                            StatusCode::BAD_GATEWAY,
                            &HeaderMap::new(),
                            b"",
                        )
                        .await
                    }
                    Err(ReplayError::Other(err)) => {
                        tracing::warn!("[{}] Error forwarding request (with auth): {:#}", id, err);
                        write_simple_response(
                            &mut client,
                            StatusCode::INTERNAL_SERVER_ERROR,
                            &HeaderMap::new(),
                            b"",
                        )
                        .await
                    }
                }
            }
            Ok(resp) => relay_reqwest_response(&mut client, id, resp).await,
            Err(err) => {
                let proxy_connect = err.is_connect() && directive.is_some();
                if proxy_connect {
                    let authority = directive.as_ref().unwrap().authority().unwrap();
                    tracing::warn!("[{}] Proxy connection to {} failed: {:#}", id, authority, err);
                    self.finder.block_proxy(authority);
                    write_simple_response(&mut client, StatusCode::BAD_GATEWAY, &HeaderMap::new(), b"")
                        .await
                } else {
                    tracing::warn!("[{}] Error forwarding request: {:#}", id, err);
                    write_simple_response(
                        &mut client,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &HeaderMap::new(),
                        b"",
                    )
                    .await
                }
            }
        }
    }

    async fn forward_once(
        &self,
        head: &RequestHead,
        url: &Url,
        body: Vec<u8>,
        directive: &Option<ProxyDirective>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let client = self.client_for(directive);
        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        // When going DIRECT the URL itself names the dial destination, so
        // it goes through the ALPACA_HOSTS rewrite; via a proxy the dial
        // destination is the proxy authority, rewritten in client_for.
        let effective_url = match directive {
            None => rewrite_dial_url(&self.aliases, url),
            Some(_) => url.clone(),
        };
        let mut headers = head.headers.clone();
        // The client re-frames the message itself. A rewritten destination
        // keeps the client's Host header, so the origin still sees the
        // name that was asked for.
        if effective_url == *url {
            headers.remove(HOST);
        }
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        client
            .request(method, effective_url)
            .headers(headers)
            .body(body)
            .send()
            .await
    }

    fn client_for(&self, directive: &Option<ProxyDirective>) -> reqwest::Client {
        let key = match directive {
            Some(directive) => {
                let authority = self.aliases.rewrite(directive.authority().unwrap());
                let scheme = if directive.is_tls() { "https" } else { "http" };
                format!("{}://{}", scheme, authority)
            }
            None => "direct".to_string(),
        };
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&key) {
            return client.clone();
        }
        // Never consult the proxy environment variables: they may well be
        // pointing at this process.
        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none());
        if key != "direct" {
            match reqwest::Proxy::all(&key) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => tracing::warn!("Invalid proxy URL {:?}: {}", key, err),
            }
        }
        let client = builder.build().expect("failed to build forwarding client");
        clients.insert(key, client.clone());
        client
    }

    async fn replay_with_auth(
        &self,
        id: u64,
        head: &RequestHead,
        url: &Url,
        body: Vec<u8>,
        directive: &Option<ProxyDirective>,
    ) -> Result<RawResponse, ReplayError> {
        let auth = self.auth.as_ref().expect("replay requires credentials");
        let mut tr = Transport::new();
        let target = match directive {
            Some(directive) => {
                // Blocklist entries carry the authority as the PAC named
                // it, not the rewritten dial destination.
                let proxy = directive.authority().unwrap();
                let dest = self.aliases.rewrite(proxy);
                tr.dial(&dest, directive.is_tls())
                    .await
                    .map_err(|e| ReplayError::ProxyConnect(proxy.to_string(), e))?;
                head.target.clone()
            }
            None => {
                // A 407 from an origin server is unusual but handled the
                // same way, with an origin-form request line.
                let authority = self.aliases.rewrite(&url_authority(url));
                tr.dial(&authority, url.scheme() == "https")
                    .await
                    .map_err(ReplayError::Other)?;
                match url.query() {
                    Some(q) => format!("{}?{}", url.path(), q),
                    None => url.path().to_string(),
                }
            }
        };
        let mut raw = RawRequest::new(&head.method, &target);
        raw.headers = head.headers.clone();
        raw.headers.remove(CONTENT_LENGTH);
        raw.headers.remove(TRANSFER_ENCODING);
        raw.headers
            .entry(HOST)
            .or_insert_with(|| host_header_value(url));
        raw.body = body;
        tracing::debug!("[{}] Replaying request with NTLM authentication", id);
        auth.authenticate(&raw, &mut tr).await.map_err(ReplayError::Other)
    }

    // ─── CONNECT tunneling ───────────────────────────────────────────────

    async fn handle_connect(
        &self,
        id: u64,
        mut head: RequestHead,
        mut client: TcpStream,
        buf: BytesMut,
    ) -> Result<u16> {
        delete_request_headers(&mut head.headers);
        // CONNECT targets have no scheme; assume https for PAC purposes.
        let url = Url::parse(&format!("https://{}/", head.target))
            .with_context(|| format!("invalid CONNECT target: {}", head.target))?;
        let directive = match self.finder.find_proxy_for_request(id, &head.method, &url).await {
            Ok(directive) => directive,
            Err(err) => {
                tracing::warn!("[{}] Error finding proxy for {}: {:#}", id, head.target, err);
                return write_simple_response(
                    &mut client,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &HeaderMap::new(),
                    b"",
                )
                .await;
            }
        };

        let (server, server_leftover) = match &directive {
            None => {
                let dest = self.aliases.rewrite(&head.target);
                match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&dest)).await {
                    Ok(Ok(stream)) => (UpstreamStream::Tcp(stream), BytesMut::new()),
                    Ok(Err(err)) => {
                        tracing::warn!("[{}] Error dialling {}: {:#}", id, dest, err);
                        return write_simple_response(
                            &mut client,
                            StatusCode::BAD_GATEWAY,
                            &HeaderMap::new(),
                            b"",
                        )
                        .await;
                    }
                    Err(_) => {
                        tracing::warn!("[{}] Timed out dialling {}", id, dest);
                        return write_simple_response(
                            &mut client,
                            StatusCode::BAD_GATEWAY,
                            &HeaderMap::new(),
                            b"",
                        )
                        .await;
                    }
                }
            }
            Some(directive) => match self.connect_via_proxy(id, &head, directive).await {
                Ok(conn) => conn,
                Err(status) => {
                    return write_simple_response(&mut client, status, &HeaderMap::new(), b"").await;
                }
            },
        };

        // From here on the client connection carries raw bytes. The
        // response line is written directly so that nothing can inject a
        // Content-Length header, which is forbidden on a successful
        // CONNECT response.
        let established = format!(
            "HTTP/1.{} 200 Connection Established\r\n\r\n",
            head.minor_version
        );
        if let Err(err) = client.write_all(established.as_bytes()).await {
            tracing::warn!("[{}] Error writing response: {:#}", id, err);
            return Ok(200);
        }

        tunnel(id, client, buf, server, server_leftover);
        Ok(200)
    }

    /// Opens a tunnel through an upstream proxy by sending it the CONNECT
    /// request, authenticating if asked. Failures map to the status the
    /// client should see.
    async fn connect_via_proxy(
        &self,
        id: u64,
        head: &RequestHead,
        directive: &ProxyDirective,
    ) -> Result<(UpstreamStream, BytesMut), StatusCode> {
        let proxy = directive.authority().unwrap();
        let dest = self.aliases.rewrite(proxy);
        let mut tr = Transport::new();
        if let Err(err) = tr.dial(&dest, directive.is_tls()).await {
            tracing::warn!("[{}] Error dialling {}: {:#}", id, dest, err);
            self.finder.block_proxy(proxy);
            return Err(StatusCode::BAD_GATEWAY);
        }
        // The method, request-target and Host header go upstream exactly
        // as received.
        let mut raw = RawRequest::new(&head.method, &head.target);
        raw.headers = head.headers.clone();
        let mut resp = match tr.round_trip(&raw).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!("[{}] Error reading CONNECT response: {:#}", id, err);
                return Err(StatusCode::BAD_GATEWAY);
            }
        };
        if resp.status == 407 {
            if let Some(auth) = &self.auth {
                // NTLM is connection-oriented: restart on a fresh
                // connection for the full dance.
                if let Err(err) = tr.dial(&dest, directive.is_tls()).await {
                    tracing::warn!("[{}] Error re-dialling {}: {:#}", id, dest, err);
                    self.finder.block_proxy(proxy);
                    return Err(StatusCode::BAD_GATEWAY);
                }
                resp = match auth.authenticate(&raw, &mut tr).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        tracing::warn!("[{}] NTLM authentication failed: {:#}", id, err);
                        return Err(StatusCode::BAD_GATEWAY);
                    }
                };
            }
        }
        if !(200..300).contains(&resp.status) {
            tracing::warn!(
                "[{}] Unexpected CONNECT response status: {} {}",
                id,
                resp.status,
                resp.reason
            );
            return Err(StatusCode::BAD_GATEWAY);
        }
        tr.hijack().map_err(|_| StatusCode::BAD_GATEWAY)
    }
}

/// Starts the two copy tasks for an established tunnel. Each task closes
/// its own destination when its copy finishes, so a half-close or EOF on
/// either side unblocks the other and no descriptor leaks.
fn tunnel(
    id: u64,
    client: TcpStream,
    client_leftover: BytesMut,
    server: UpstreamStream,
    server_leftover: BytesMut,
) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut server_read, mut server_write) = tokio::io::split(server);
    tokio::spawn(async move {
        if !client_leftover.is_empty() && server_write.write_all(&client_leftover).await.is_err() {
            return;
        }
        if let Err(err) = tokio::io::copy(&mut client_read, &mut server_write).await {
            tracing::debug!("[{}] Tunnel copy to server ended: {}", id, err);
        }
        let _ = server_write.shutdown().await;
    });
    tokio::spawn(async move {
        if !server_leftover.is_empty() && client_write.write_all(&server_leftover).await.is_err() {
            return;
        }
        if let Err(err) = tokio::io::copy(&mut server_read, &mut client_write).await {
            tracing::debug!("[{}] Tunnel copy to client ended: {}", id, err);
        }
        let _ = client_write.shutdown().await;
    });
}

enum ReplayError {
    /// Failed to reach the upstream proxy; the authority should be
    /// blocklisted.
    ProxyConnect(String, anyhow::Error),
    Other(anyhow::Error),
}

fn url_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Applies the ALPACA_HOSTS rewrite to a request URL whose host is the
/// dial destination (DIRECT forwarding). An alias that doesn't survive URL
/// surgery leaves the request untouched.
fn rewrite_dial_url(aliases: &HostAliases, url: &Url) -> Url {
    if aliases.is_empty() {
        return url.clone();
    }
    let dest = url_authority(url);
    let rewritten = aliases.rewrite(&dest);
    if rewritten == dest {
        return url.clone();
    }
    let (host, port) = crate::hosts::split_host_port(&rewritten);
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let mut out = url.clone();
    if out.set_host(Some(&host)).is_err() {
        tracing::warn!("Ignoring unusable ALPACA_HOSTS alias for {}: {:?}", dest, rewritten);
        return url.clone();
    }
    if let Some(port) = port.and_then(|p| p.parse::<u16>().ok()) {
        let _ = out.set_port(Some(port));
    }
    out
}

fn host_header_value(url: &Url) -> HeaderValue {
    let host = url.host_str().unwrap_or_default();
    let value = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static(""))
}

// ─── Hop-by-hop header scrubbing ─────────────────────────────────────────

/// Removes every header named by a token in a Connection header value,
/// skipping the `close` token.
fn delete_connection_tokens(headers: &mut HeaderMap) {
    let tokens: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty() && t != "close")
        .collect();
    for token in tokens {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
}

pub fn delete_request_headers(headers: &mut HeaderMap) {
    delete_connection_tokens(headers);
    headers.remove(CONNECTION);
    headers.remove(HeaderName::from_static("keep-alive"));
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(HeaderName::from_static("te"));
    headers.remove(UPGRADE);
}

pub fn delete_response_headers(headers: &mut HeaderMap) {
    delete_connection_tokens(headers);
    headers.remove(CONNECTION);
    headers.remove(HeaderName::from_static("keep-alive"));
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(HeaderName::from_static("trailer"));
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
}

// ─── Response writing ────────────────────────────────────────────────────

async fn write_response_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    headers: &HeaderMap,
) -> std::io::Result<()> {
    let reason = if reason.is_empty() {
        StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
    } else {
        reason
    };
    writer
        .write_all(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes())
        .await?;
    for (name, value) in headers {
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    // One exchange per client connection.
    writer.write_all(b"Connection: close\r\n\r\n").await?;
    Ok(())
}

async fn write_simple_response(
    client: &mut TcpStream,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<u16> {
    let mut headers = headers.clone();
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string())?,
    );
    write_response_head(client, status.as_u16(), "", &headers).await?;
    client.write_all(body).await?;
    client.flush().await?;
    Ok(status.as_u16())
}

async fn relay_raw_response(client: &mut TcpStream, mut resp: RawResponse) -> Result<u16> {
    delete_response_headers(&mut resp.headers);
    resp.headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&resp.body.len().to_string())?,
    );
    write_response_head(client, resp.status, &resp.reason, &resp.headers).await?;
    client.write_all(&resp.body).await?;
    client.flush().await?;
    Ok(resp.status)
}

async fn relay_reqwest_response(
    client: &mut TcpStream,
    id: u64,
    mut resp: reqwest::Response,
) -> Result<u16> {
    let status = resp.status().as_u16();
    let mut headers = resp.headers().clone();
    delete_response_headers(&mut headers);
    write_response_head(client, status, "", &headers).await?;
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(err) = client.write_all(&chunk).await {
                    tracing::debug!("[{}] Error writing response body: {}", id, err);
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                // The status line is long gone; all we can do is log and
                // drop the connection.
                tracing::warn!("[{}] Error copying response body: {}", id, err);
                break;
            }
        }
    }
    client.flush().await.ok();
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn request_scrub_removes_hop_by_hop_headers() {
        let mut h = headers(&[
            ("proxy-authorization", "NTLM abc"),
            ("keep-alive", "timeout=5"),
            ("te", "trailers"),
            ("upgrade", "h2c"),
            ("connection", "keep-alive"),
            ("accept", "*/*"),
        ]);
        delete_request_headers(&mut h);
        assert_eq!(h.len(), 1);
        assert!(h.contains_key("accept"));
    }

    #[test]
    fn connection_tokens_name_headers_to_remove() {
        let mut h = headers(&[
            ("connection", "x-custom-hop, close"),
            ("x-custom-hop", "value"),
            ("x-kept", "value"),
        ]);
        delete_request_headers(&mut h);
        assert!(!h.contains_key("x-custom-hop"));
        assert!(h.contains_key("x-kept"));
    }

    #[test]
    fn response_scrub_also_removes_framing_headers() {
        let mut h = headers(&[
            ("proxy-authenticate", "NTLM"),
            ("trailer", "Expires"),
            ("transfer-encoding", "chunked"),
            ("content-type", "text/plain"),
        ]);
        delete_response_headers(&mut h);
        assert_eq!(h.len(), 1);
        assert!(h.contains_key("content-type"));
    }

    #[test]
    fn scrubbing_is_idempotent() {
        let mut once = headers(&[
            ("connection", "x-hop"),
            ("x-hop", "v"),
            ("upgrade", "h2c"),
            ("accept", "*/*"),
        ]);
        delete_request_headers(&mut once);
        let mut twice = once.clone();
        delete_request_headers(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn direct_dial_urls_go_through_the_alias_map() {
        let aliases = HostAliases::parse("*.internal=127.0.0.1");
        let url = Url::parse("http://db.internal:5432/path?q=1").unwrap();
        assert_eq!(
            rewrite_dial_url(&aliases, &url).as_str(),
            "http://127.0.0.1:5432/path?q=1"
        );
        // Aliases carrying their own port replace the whole destination.
        let aliases = HostAliases::parse("intranet=127.0.0.1:8080");
        let url = Url::parse("http://intranet/").unwrap();
        assert_eq!(
            rewrite_dial_url(&aliases, &url).as_str(),
            "http://127.0.0.1:8080/"
        );
        // Non-matching hosts pass through untouched.
        let url = Url::parse("http://example.com/x").unwrap();
        assert_eq!(rewrite_dial_url(&aliases, &url), url);
    }

    #[test]
    fn url_authority_includes_default_ports() {
        assert_eq!(
            url_authority(&Url::parse("http://example.test/x").unwrap()),
            "example.test:80"
        );
        assert_eq!(
            url_authority(&Url::parse("https://example.test/x").unwrap()),
            "example.test:443"
        );
        assert_eq!(
            url_authority(&Url::parse("http://example.test:8080/x").unwrap()),
            "example.test:8080"
        );
    }
}
