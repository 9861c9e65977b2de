// Turns a request into an upstream choice: runs the PAC script, parses the
// resulting directive list, and skips proxies that recently failed.
use crate::blocklist::Blocklist;
use crate::pacfetcher::PacFetcher;
use crate::pacrunner::PacRunner;
use crate::pacwrapper::PacWrapper;
use anyhow::{anyhow, bail, Context as _, Result};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// One parsed entry from a PAC result string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDirective {
    Direct,
    Http(String),
    Https(String),
}

impl ProxyDirective {
    pub fn authority(&self) -> Option<&str> {
        match self {
            ProxyDirective::Direct => None,
            ProxyDirective::Http(authority) | ProxyDirective::Https(authority) => Some(authority),
        }
    }

    /// The proxy URL to hand to an HTTP client, or None for DIRECT.
    pub fn proxy_url(&self) -> Option<String> {
        match self {
            ProxyDirective::Direct => None,
            ProxyDirective::Http(authority) => Some(format!("http://{}", authority)),
            ProxyDirective::Https(authority) => Some(format!("https://{}", authority)),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ProxyDirective::Https(_))
    }
}

impl fmt::Display for ProxyDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyDirective::Direct => write!(f, "DIRECT"),
            ProxyDirective::Http(authority) => write!(f, "PROXY {}", authority),
            ProxyDirective::Https(authority) => write!(f, "HTTPS {}", authority),
        }
    }
}

pub struct ProxyFinder {
    fetcher: PacFetcher,
    runner: PacRunner,
    wrapper: Arc<PacWrapper>,
    blocked: Blocklist,
    update_lock: tokio::sync::Mutex<()>,
}

impl ProxyFinder {
    /// The fetcher is always constructed, even with no PAC URL configured:
    /// an empty URL makes the fetcher consult platform discovery on every
    /// download attempt, so a PAC URL that appears later (or after a
    /// network change) is picked up. Until one appears, the fetcher stays
    /// disconnected and all requests route DIRECT.
    pub fn new(pacurl: &str, wrapper: Arc<PacWrapper>) -> Result<Self> {
        if pacurl.is_empty() {
            tracing::info!(
                "No PAC URL specified; deferring to platform discovery (DIRECT until one appears)"
            );
        } else {
            Url::parse(pacurl).with_context(|| format!("invalid PAC URL: {}", pacurl))?;
        }
        Ok(Self::with_fetcher(PacFetcher::new(pacurl), wrapper))
    }

    fn with_fetcher(fetcher: PacFetcher, wrapper: Arc<PacWrapper>) -> Self {
        ProxyFinder {
            fetcher,
            runner: PacRunner::new(),
            wrapper,
            blocked: Blocklist::new(),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Refetches the PAC if the network changed, and installs it. Runs
    /// before each request is handled; the fetcher's own gating makes the
    /// common case cheap. Installing a new PAC resets the blocklist, as
    /// does losing connectivity, so stale entries never outlive the script
    /// that produced them.
    pub async fn check_for_updates(&self) {
        let _guard = self.update_lock.lock().await;
        let Some(pacjs) = self.fetcher.download().await else {
            if !self.fetcher.is_connected() {
                self.blocked.clear();
                self.wrapper.wrap(None);
            }
            return;
        };
        self.blocked.clear();
        let runner = self.runner.clone();
        let compile = {
            let pacjs = pacjs.clone();
            tokio::task::spawn_blocking(move || runner.update(&pacjs))
        };
        match compile.await {
            Ok(Ok(())) => self.wrapper.wrap(Some(&pacjs)),
            Ok(Err(err)) => tracing::warn!("Error running PAC JS: {}", err),
            Err(err) => tracing::warn!("PAC compile task failed: {}", err),
        }
    }

    /// Chooses the upstream for a request. None means DIRECT.
    pub async fn find_proxy_for_request(
        &self,
        id: u64,
        method: &str,
        url: &Url,
    ) -> Result<Option<ProxyDirective>> {
        if !self.fetcher.is_connected() {
            tracing::info!("[{}] {} {} via \"DIRECT\" (not connected)", id, method, url);
            return Ok(None);
        }
        let result = {
            let runner = self.runner.clone();
            let url = url.clone();
            tokio::task::spawn_blocking(move || runner.find_proxy_for_url(&url))
                .await
                .map_err(|e| anyhow!("PAC evaluation task failed: {}", e))??
        };
        self.select_directive(&result, id, method, url)
    }

    fn select_directive(
        &self,
        result: &str,
        id: u64,
        method: &str,
        url: &Url,
    ) -> Result<Option<ProxyDirective>> {
        // The first non-blocked directive wins. If every parseable proxy is
        // blocked, fall back to the first blocked one rather than failing
        // outright; a recently bad proxy beats no proxy at all.
        let mut fallback = None;
        for elem in result.split(';') {
            let elem = elem.trim();
            let fields: Vec<&str> = elem.split_whitespace().collect();
            let directive = match fields.as_slice() {
                ["DIRECT"] => {
                    tracing::info!("[{}] {} {} via {:?}", id, method, url, elem);
                    return Ok(None);
                }
                ["PROXY" | "HTTP", authority] => {
                    ProxyDirective::Http(ensure_port(authority, 80))
                }
                ["HTTPS", authority] => ProxyDirective::Https(ensure_port(authority, 443)),
                [] => continue,
                _ => {
                    tracing::warn!("[{}] Couldn't parse proxy: {:?}", id, elem);
                    continue;
                }
            };
            let authority = directive.authority().unwrap();
            if self.blocked.contains(authority) {
                tracing::info!("[{}] Skipping bad proxy: {:?}", id, authority);
                if fallback.is_none() {
                    fallback = Some(directive);
                }
                continue;
            }
            tracing::info!("[{}] {} {} via {:?}", id, method, url, elem);
            return Ok(Some(directive));
        }
        if let Some(directive) = fallback {
            tracing::info!(
                "[{}] All proxies are blocked; trying {:?} anyway",
                id,
                directive.authority().unwrap()
            );
            return Ok(Some(directive));
        }
        bail!("no proxies available")
    }

    /// Reported by the engine when a proxy fails to accept a connection.
    pub fn block_proxy(&self, authority: &str) {
        self.blocked.add(authority);
    }
}

/// Appends a default port when the PAC directive omitted one. The result
/// eventually reaches a dialer, which always needs a port.
fn ensure_port(authority: &str, default: u16) -> String {
    if let Some(rest) = authority.strip_prefix('[') {
        if rest.find(']').is_some_and(|end| rest[end + 1..].starts_with(':')) {
            return authority.to_string();
        }
        return format!("{}:{}", authority, default);
    }
    if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmonitor::NetMonitor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_url() -> Url {
        Url::parse("http://www.example.com/").unwrap()
    }

    fn finder() -> ProxyFinder {
        // A finder with an empty PAC URL, so its fetcher never connects;
        // only select_directive and block_proxy are exercised.
        ProxyFinder::new("", Arc::new(PacWrapper::new(3128))).unwrap()
    }

    #[test]
    fn direct_wins_immediately() {
        let f = finder();
        let d = f.select_directive("DIRECT; PROXY p:80", 1, "GET", &test_url()).unwrap();
        assert_eq!(d, None);
    }

    #[test]
    fn proxy_and_http_tokens_default_to_port_80() {
        let f = finder();
        let d = f.select_directive("PROXY proxy.example.com", 1, "GET", &test_url()).unwrap();
        assert_eq!(d, Some(ProxyDirective::Http("proxy.example.com:80".into())));
        let d = f.select_directive("HTTP proxy.example.com:3128", 1, "GET", &test_url()).unwrap();
        assert_eq!(d, Some(ProxyDirective::Http("proxy.example.com:3128".into())));
    }

    #[test]
    fn https_token_defaults_to_port_443() {
        let f = finder();
        let d = f.select_directive("HTTPS secure.example.com", 1, "GET", &test_url()).unwrap();
        assert_eq!(d, Some(ProxyDirective::Https("secure.example.com:443".into())));
    }

    #[test]
    fn unparseable_directives_are_skipped() {
        let f = finder();
        let d = f
            .select_directive("SOCKS sock:1080; PROXY good:80", 1, "GET", &test_url())
            .unwrap();
        assert_eq!(d, Some(ProxyDirective::Http("good:80".into())));
    }

    #[test]
    fn nothing_parseable_is_an_error() {
        let f = finder();
        assert!(f.select_directive("SOCKS sock:1080", 1, "GET", &test_url()).is_err());
        assert!(f.select_directive("", 1, "GET", &test_url()).is_err());
    }

    #[test]
    fn blocked_proxies_are_skipped() {
        let f = finder();
        f.block_proxy("bad:80");
        let d = f
            .select_directive("PROXY bad:80; PROXY good:80", 1, "GET", &test_url())
            .unwrap();
        assert_eq!(d, Some(ProxyDirective::Http("good:80".into())));
    }

    #[test]
    fn all_blocked_falls_back_to_the_first() {
        let f = finder();
        f.block_proxy("one:80");
        f.block_proxy("two:80");
        let d = f
            .select_directive("PROXY one:80; PROXY two:80", 1, "GET", &test_url())
            .unwrap();
        assert_eq!(d, Some(ProxyDirective::Http("one:80".into())));
    }

    #[test]
    fn ensure_port_handles_ipv6_literals() {
        assert_eq!(ensure_port("[::1]", 80), "[::1]:80");
        assert_eq!(ensure_port("[::1]:3128", 80), "[::1]:3128");
        assert_eq!(ensure_port("host", 443), "host:443");
    }

    async fn serve_pac(body: &[u8], times: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/proxy.pac", listener.local_addr().unwrap());
        let response = {
            let mut r = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            r.extend_from_slice(body);
            r
        };
        tokio::spawn(async move {
            for _ in 0..times {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(&response).await;
            }
        });
        url
    }

    fn changed_once_monitor() -> NetMonitor {
        NetMonitor::with_enumerator(Box::new(|| Ok(vec!["10.1.2.3".to_string()])))
    }

    #[tokio::test]
    async fn update_then_find_uses_the_pac() {
        let pac = br#"function FindProxyForURL(url, host) { return "PROXY upstream:3128"; }"#;
        let url = serve_pac(pac, 1).await;
        let wrapper = Arc::new(PacWrapper::new(3128));
        let fetcher = PacFetcher::with_monitor(&url, changed_once_monitor());
        let finder = ProxyFinder::with_fetcher(fetcher, wrapper);
        finder.check_for_updates().await;
        let d = finder
            .find_proxy_for_request(1, "GET", &test_url())
            .await
            .unwrap();
        assert_eq!(d, Some(ProxyDirective::Http("upstream:3128".into())));
    }

    #[tokio::test]
    async fn disconnected_finder_goes_direct() {
        let wrapper = Arc::new(PacWrapper::new(3128));
        // Fetcher pointed at a dead URL; download fails, connected stays
        // false, and requests route DIRECT.
        let fetcher = PacFetcher::with_monitor("http://127.0.0.1:1/nope.pac", changed_once_monitor())
            .with_retry_delay(std::time::Duration::from_millis(10));
        let finder = ProxyFinder::with_fetcher(fetcher, wrapper);
        finder.check_for_updates().await;
        let d = finder
            .find_proxy_for_request(1, "GET", &test_url())
            .await
            .unwrap();
        assert_eq!(d, None);
    }

    #[tokio::test]
    async fn new_pac_resets_the_blocklist() {
        let pac = br#"function FindProxyForURL(url, host) { return "PROXY upstream:3128"; }"#;
        let url = serve_pac(pac, 2).await;
        let monitor = {
            // Reports a change on the first and third snapshots.
            let calls = std::sync::atomic::AtomicUsize::new(0);
            NetMonitor::with_enumerator(Box::new(move || {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Ok(vec!["10.0.0.1".to_string()])
                } else {
                    Ok(vec!["10.0.0.2".to_string()])
                }
            }))
        };
        let wrapper = Arc::new(PacWrapper::new(3128));
        let fetcher = PacFetcher::with_monitor(&url, monitor);
        let finder = ProxyFinder::with_fetcher(fetcher, wrapper);
        finder.check_for_updates().await;
        finder.block_proxy("upstream:3128");
        // No change yet: the proxy stays blocked, so the fallback rule
        // returns it anyway (it's the only candidate).
        finder.check_for_updates().await;
        assert!(finder.blocked.contains("upstream:3128"));
        // Network change: PAC refetched, blocklist reset.
        finder.check_for_updates().await;
        assert!(!finder.blocked.contains("upstream:3128"));
    }
}
