// Credential sources. The password itself never outlives the function that
// read it; everything downstream works from the NTLM hash.
use crate::auth::Authenticator;
use anyhow::{anyhow, bail, Context as _, Result};
use std::io::{BufRead, IsTerminal, Write};

/// Prompts for the password on the terminal and hashes it immediately.
/// With stdin redirected (scripts, tests) the password is read as a plain
/// line instead of through the no-echo prompt.
pub fn from_terminal(domain: &str, username: &str) -> Result<Authenticator> {
    print!("Password (for {}\\{}): ", domain, username);
    std::io::stdout().flush()?;
    let password = if std::io::stdin().is_terminal() {
        rpassword::read_password().context("error reading password from stdin")?
    } else {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("error reading password from stdin")?;
        line.trim_end_matches(['\r', '\n']).to_string()
    };
    println!();
    Ok(Authenticator::from_password(domain, username, &password))
}

/// Parses the NTLM_CREDENTIALS format: `user@domain:hex(ntlm_hash)`.
pub fn from_env_var(value: &str) -> Result<Authenticator> {
    let at = value.find('@');
    let colon = value.find(':');
    let (Some(at), Some(colon)) = (at, colon) else {
        bail!("invalid credentials string, please run `alpaca -H`");
    };
    if at > colon {
        bail!("invalid credentials string, please run `alpaca -H`");
    }
    let username = &value[..at];
    let domain = &value[at + 1..colon];
    let hash = hex::decode(&value[colon + 1..])
        .map_err(|e| anyhow!("invalid hash, please run `alpaca -H`: {}", e))?;
    tracing::info!("Found credentials for {}\\{} in environment", domain, username);
    Ok(Authenticator::new(domain, username, hash))
}
