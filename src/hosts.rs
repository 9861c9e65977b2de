// Optional rewriting of outbound dial destinations, driven by the
// ALPACA_HOSTS environment variable. This is an escape hatch for
// split-horizon DNS, where a hostname resolves differently (or not at all)
// on the client side of the corporate proxy.
use regex::Regex;

pub struct HostAliases {
    rules: Vec<(Regex, String)>,
}

impl HostAliases {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("ALPACA_HOSTS").unwrap_or_default())
    }

    /// Parses a comma-separated list of `pattern=alias` entries. The
    /// pattern is a shell glob matched against the hostname of the dial
    /// destination. Malformed entries are logged and skipped.
    pub fn parse(list: &str) -> Self {
        let mut rules = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((pattern, alias)) = entry.split_once('=') else {
                tracing::warn!("Ignoring ALPACA_HOSTS entry without '=': {:?}", entry);
                continue;
            };
            match compile_glob(pattern) {
                Ok(re) => rules.push((re, alias.to_string())),
                Err(err) => {
                    tracing::warn!("Ignoring ALPACA_HOSTS pattern {:?}: {}", pattern, err)
                }
            }
        }
        HostAliases { rules }
    }

    /// Rewrites a `host:port` dial destination. The alias replaces the
    /// hostname; an alias that itself contains a colon replaces the whole
    /// destination, port included.
    pub fn rewrite(&self, dest: &str) -> String {
        let (host, port) = split_host_port(dest);
        for (pattern, alias) in &self.rules {
            if pattern.is_match(host) {
                tracing::debug!("Rewriting dial destination {:?} to {:?}", host, alias);
                return match (alias.contains(':'), port) {
                    (false, Some(port)) => format!("{}:{}", alias, port),
                    _ => alias.clone(),
                };
            }
        }
        dest.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Splits `host:port`, tolerating bracketed IPv6 literals.
pub(crate) fn split_host_port(dest: &str) -> (&str, Option<&str>) {
    if let Some(rest) = dest.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..].strip_prefix(':');
            return (host, port);
        }
    }
    match dest.rsplit_once(':') {
        // More than one colon and no brackets: a bare IPv6 literal.
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (dest, None),
    }
}

/// Compiles a shell glob (`*` and `?` wildcards) into an anchored regex.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            _ => re.push_str(&regex::escape(&ch.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}
