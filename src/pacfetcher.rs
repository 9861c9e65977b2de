// Downloads the PAC script, gated on the network monitor so that we only
// refetch when something about the local network has actually changed.
use crate::netmonitor::NetMonitor;
use anyhow::{bail, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// The maximum size allowed for a PAC script. At 1 MiB this matches the
/// limit in Chrome.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// The time to wait before retrying a failed PAC download, similar to
/// Chrome's delay. Downloads often fail when attempted too soon after a
/// network change.
const DELAY_AFTER_FAILED_DOWNLOAD: Duration = Duration::from_secs(2);

pub struct PacFetcher {
    pacurl: String,
    client: reqwest::Client,
    state: Mutex<FetchState>,
    connected: AtomicBool,
    retry_delay: Duration,
}

struct FetchState {
    monitor: NetMonitor,
    last_url: String,
}

impl PacFetcher {
    pub fn new(pacurl: &str) -> Self {
        Self::with_monitor(pacurl, NetMonitor::new())
    }

    pub fn with_monitor(pacurl: &str, monitor: NetMonitor) -> Self {
        // The ambient http(s)_proxy environment variables could be pointing
        // at this very process; PAC fetches always go directly to the
        // server.
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build PAC fetch client");
        PacFetcher {
            pacurl: pacurl.to_string(),
            client,
            state: Mutex::new(FetchState {
                monitor,
                last_url: String::new(),
            }),
            connected: AtomicBool::new(false),
            retry_delay: DELAY_AFTER_FAILED_DOWNLOAD,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns a fresh PAC script, or None when there is nothing new: the
    /// network fingerprint and PAC URL are unchanged, or the download
    /// failed. A download failure leaves the fetcher disconnected, which
    /// routes traffic directly until the next network change.
    pub async fn download(&self) -> Option<Vec<u8>> {
        let pacurl = if self.pacurl.is_empty() {
            match find_pac_url() {
                Ok(url) => url,
                Err(err) => {
                    tracing::warn!("Error while trying to detect PAC URL: {}", err);
                    return None;
                }
            }
        } else {
            self.pacurl.clone()
        };
        {
            let mut state = self.state.lock().unwrap();
            let net_changed = state.monitor.addrs_changed();
            if !net_changed && pacurl == state.last_url {
                return None;
            }
            state.last_url = pacurl.clone();
        }
        self.connected.store(false, Ordering::SeqCst);
        if pacurl.is_empty() {
            return None;
        }
        tracing::info!("Attempting to download PAC from {}", pacurl);
        let body = match self.fetch(&pacurl).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    "Error downloading PAC file, will retry after {:?}: {}",
                    self.retry_delay,
                    err
                );
                tokio::time::sleep(self.retry_delay).await;
                match self.fetch(&pacurl).await {
                    Ok(body) => body,
                    Err(err) => {
                        tracing::warn!("Error downloading PAC file, giving up: {}", err);
                        return None;
                    }
                }
            }
        };
        let body = match body {
            Some(body) => body,
            None => {
                tracing::warn!("PAC JS is too big (limit is {} bytes)", MAX_RESPONSE_BYTES);
                return None;
            }
        };
        if pacurl.starts_with("file:") {
            // A local PAC file says nothing about whether the corporate
            // network is reachable. Reverse DNS resolution of a public
            // address standing in for that signal.
            if reverse_dns_probe().await {
                self.connected.store(true, Ordering::SeqCst);
            } else {
                tracing::info!("No public DNS reachability; routing DIRECT despite local PAC");
            }
        } else {
            self.connected.store(true, Ordering::SeqCst);
        }
        Some(body)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fetches the PAC body. `Ok(None)` means the body exceeded the size
    /// limit, which is terminal (no retry); `Err` is a transient failure.
    async fn fetch(&self, pacurl: &str) -> Result<Option<Vec<u8>>> {
        if pacurl.starts_with("file:") {
            return fetch_file(pacurl).await;
        }
        let resp = self.client.get(pacurl).send().await?;
        if !resp.status().is_success() {
            bail!("expected success status, got {}", resp.status());
        }
        let mut resp = resp;
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Ok(None);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Some(body))
    }
}

async fn fetch_file(pacurl: &str) -> Result<Option<Vec<u8>>> {
    let path = file_url_to_path(pacurl);
    let body = tokio::fs::read(&path).await?;
    if body.len() > MAX_RESPONSE_BYTES {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Turns a file:// URL into a filesystem path. Relative paths (anything
/// after the scheme that doesn't start with a slash) resolve against the
/// working directory.
fn file_url_to_path(pacurl: &str) -> PathBuf {
    let rest = pacurl
        .strip_prefix("file://")
        .or_else(|| pacurl.strip_prefix("file:"))
        .unwrap_or(pacurl);
    PathBuf::from(rest)
}

/// True when a reverse DNS lookup of either of Google's public DNS servers
/// succeeds within two seconds. Timing out counts as unreachable.
async fn reverse_dns_probe() -> bool {
    let lookup = |ip: &'static str| {
        tokio::task::spawn_blocking(move || {
            let addr: IpAddr = ip.parse().unwrap();
            dns_lookup::lookup_addr(&addr).is_ok()
        })
    };
    let v4 = lookup("8.8.8.8");
    let v6 = lookup("2001:4860:4860::8888");
    let both = async {
        let (v4, v6) = tokio::join!(v4, v6);
        v4.unwrap_or(false) || v6.unwrap_or(false)
    };
    tokio::time::timeout(Duration::from_secs(2), both)
        .await
        .unwrap_or(false)
}

/// Platform-specific PAC URL discovery. Reading the desktop proxy settings
/// is only implemented for the platforms that expose them; everywhere else
/// an empty URL means "run in DIRECT-only mode unless -C is given".
pub fn find_pac_url() -> Result<String> {
    Ok(String::new())
}
