// Command-line configuration.
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "alpaca", version, about = "Local HTTP proxy for upstream NTLM proxies")]
pub struct Args {
    /// Port number to listen on.
    #[arg(short = 'p', default_value_t = 3128)]
    pub port: u16,

    /// Address to listen on; repeat the flag to listen on several.
    #[arg(short = 'l', default_value = "localhost")]
    pub listen: Vec<String>,

    /// URL of the proxy auto-config (PAC) file. When absent, platform
    /// discovery is consulted; when that also comes up empty, all requests
    /// go directly.
    #[arg(short = 'C')]
    pub pac_url: Option<String>,

    /// Domain of the proxy account (for NTLM auth).
    #[arg(short = 'd')]
    pub domain: Option<String>,

    /// Username of the proxy account (for NTLM auth).
    #[arg(short = 'u')]
    pub username: Option<String>,

    /// Print the hashed credentials line for NTLM_CREDENTIALS and exit.
    #[arg(short = 'H')]
    pub hash_credentials: bool,
}

impl Args {
    /// The username to authenticate as: the -u flag, falling back to the
    /// invoking user.
    pub fn effective_username(&self) -> String {
        self.username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["alpaca"]);
        assert_eq!(args.port, 3128);
        assert_eq!(args.listen, vec!["localhost".to_string()]);
        assert!(args.pac_url.is_none());
        assert!(!args.hash_credentials);
    }

    #[test]
    fn listen_flag_is_repeatable() {
        let args = Args::parse_from(["alpaca", "-l", "127.0.0.1", "-l", "::1"]);
        assert_eq!(args.listen, vec!["127.0.0.1".to_string(), "::1".to_string()]);
    }

    #[test]
    fn credential_flags() {
        let args = Args::parse_from(["alpaca", "-d", "CORP", "-u", "malory", "-H"]);
        assert_eq!(args.domain.as_deref(), Some("CORP"));
        assert_eq!(args.effective_username(), "malory");
        assert!(args.hash_credentials);
    }
}
