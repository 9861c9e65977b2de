// Detects changes to the local network fingerprint, which is what gates PAC
// refetches. The fingerprint is the set of interface addresses plus the
// local IPs that the routing table would pick for a handful of well-known
// destinations.
use std::io;
use std::net::{IpAddr, UdpSocket};

/// Public destinations used to find the interface that carries internet
/// traffic. One IPv4, one IPv6.
pub const PUBLIC_PROBES: [&str; 2] = ["8.8.8.8", "2001:4860:4860::8888"];

/// Private-range destinations, probed to catch VPN and split-tunnel setups
/// whose routes don't show up as interface addresses.
pub const PRIVATE_PROBES: [&str; 4] = ["10.0.0.0", "172.16.0.0", "192.168.0.0", "FC00::"];

pub type AddrEnumerator = Box<dyn Fn() -> io::Result<Vec<String>> + Send>;

pub struct NetMonitor {
    snapshot: Option<NetSnapshot>,
    get_addrs: AddrEnumerator,
}

#[derive(PartialEq, Eq)]
struct NetSnapshot {
    addrs: std::collections::BTreeSet<String>,
    // One entry per probe destination, in a fixed order. Ports never appear
    // here, so OS-assigned ephemeral ports can't register as a change.
    routes: Vec<Option<IpAddr>>,
}

impl NetMonitor {
    pub fn new() -> Self {
        Self::with_enumerator(Box::new(interface_addrs))
    }

    pub fn with_enumerator(get_addrs: AddrEnumerator) -> Self {
        NetMonitor {
            snapshot: None,
            get_addrs,
        }
    }

    /// Returns true iff the network fingerprint has changed since the last
    /// call. The first call always returns true.
    pub fn addrs_changed(&mut self) -> bool {
        let addrs = match (self.get_addrs)() {
            Ok(addrs) => addrs,
            Err(err) => {
                tracing::warn!("Error enumerating network interface addresses: {}", err);
                return false;
            }
        };
        let snapshot = NetSnapshot {
            addrs: addrs.into_iter().collect(),
            routes: PUBLIC_PROBES
                .iter()
                .chain(PRIVATE_PROBES.iter())
                .map(|dest| probe_route(dest))
                .collect(),
        };
        if self.snapshot.as_ref() == Some(&snapshot) {
            false
        } else {
            tracing::info!("Network change detected: {:?}", snapshot.addrs);
            self.snapshot = Some(snapshot);
            true
        }
    }
}

fn interface_addrs() -> io::Result<Vec<String>> {
    Ok(if_addrs::get_if_addrs()?
        .into_iter()
        .map(|iface| iface.ip().to_string())
        .collect())
}

/// Finds the local IP that would carry traffic to `dest` by connecting a UDP
/// socket (no packets are sent) and reading its local address. VPN clients
/// often route through addresses that don't appear in the interface list, so
/// the routing table is the only reliable witness.
pub fn probe_route(dest: &str) -> Option<IpAddr> {
    let dest: IpAddr = dest.parse().ok()?;
    let bind = if dest.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect((dest, 53)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if is_loopback_or_link_local(&ip) {
        None
    } else {
        Some(ip)
    }
}

pub fn is_loopback_or_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn monitor_with(addrs: Vec<Vec<String>>) -> NetMonitor {
        let calls = Arc::new(AtomicUsize::new(0));
        NetMonitor::with_enumerator(Box::new(move || {
            let i = calls.fetch_add(1, Ordering::SeqCst).min(addrs.len() - 1);
            Ok(addrs[i].clone())
        }))
    }

    #[test]
    fn first_call_reports_a_change() {
        let mut nm = monitor_with(vec![vec!["127.0.0.1".to_string()]]);
        assert!(nm.addrs_changed());
        assert!(!nm.addrs_changed());
    }

    #[test]
    fn added_address_reports_a_change() {
        let loopback = vec!["127.0.0.1".to_string()];
        let wifi = vec!["127.0.0.1".to_string(), "192.168.1.2".to_string()];
        let mut nm = monitor_with(vec![loopback.clone(), loopback, wifi.clone(), wifi]);
        assert!(nm.addrs_changed());
        assert!(!nm.addrs_changed());
        assert!(nm.addrs_changed());
        assert!(!nm.addrs_changed());
    }

    #[test]
    fn address_order_does_not_matter() {
        let a = vec!["10.0.0.2".to_string(), "192.168.1.2".to_string()];
        let b = vec!["192.168.1.2".to_string(), "10.0.0.2".to_string()];
        let mut nm = monitor_with(vec![a, b]);
        assert!(nm.addrs_changed());
        assert!(!nm.addrs_changed());
    }

    #[test]
    fn enumeration_error_reads_as_unchanged() {
        let mut nm = NetMonitor::with_enumerator(Box::new(|| {
            Err(io::Error::new(io::ErrorKind::Other, "no netlink"))
        }));
        assert!(!nm.addrs_changed());
    }

    #[test]
    fn link_local_addresses_are_discarded() {
        assert!(is_loopback_or_link_local(&"127.0.0.1".parse().unwrap()));
        assert!(is_loopback_or_link_local(&"169.254.1.1".parse().unwrap()));
        assert!(is_loopback_or_link_local(&"::1".parse().unwrap()));
        assert!(is_loopback_or_link_local(&"fe80::1".parse().unwrap()));
        assert!(!is_loopback_or_link_local(&"192.168.1.2".parse().unwrap()));
        assert!(!is_loopback_or_link_local(&"2001:db8::1".parse().unwrap()));
    }
}
