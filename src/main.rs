mod auth;
mod blocklist;
mod config;
mod context;
mod credentials;
mod hosts;
mod netmonitor;
mod pacfetcher;
mod pacrunner;
mod pacwrapper;
mod parse;
mod proxy;
mod proxyfinder;
mod transport;

use anyhow::{Context as _, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let args = config::Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // TLS configuration is process-wide and only touched here, at startup.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    if args.hash_credentials {
        let domain = args.domain.clone().unwrap_or_default();
        let auth = credentials::from_terminal(&domain, &args.effective_username())?;
        // The printed line is the NTLM_CREDENTIALS value itself.
        println!("{}", auth.credentials_line());
        return Ok(());
    }

    let auth = if args.domain.is_some() {
        let domain = args.domain.clone().unwrap();
        Some(credentials::from_terminal(&domain, &args.effective_username())?)
    } else if let Ok(value) = std::env::var("NTLM_CREDENTIALS") {
        match credentials::from_env_var(&value) {
            Ok(auth) => Some(auth),
            Err(err) => {
                tracing::warn!("Ignoring NTLM_CREDENTIALS: {}", err);
                None
            }
        }
    } else {
        None
    };
    if auth.is_none() {
        tracing::info!("No credentials configured; 407 responses will be passed through");
    }

    let pacurl = match &args.pac_url {
        Some(url) => url.clone(),
        None => pacfetcher::find_pac_url().context("error while trying to detect PAC URL")?,
    };

    let wrapper = Arc::new(pacwrapper::PacWrapper::new(args.port));
    let finder = Arc::new(proxyfinder::ProxyFinder::new(&pacurl, Arc::clone(&wrapper))?);
    let aliases = Arc::new(hosts::HostAliases::from_env());
    if !aliases.is_empty() {
        tracing::info!("Dial destinations will be rewritten per ALPACA_HOSTS");
    }
    let server = proxy::ProxyServer::new(finder, wrapper, auth.map(Arc::new), aliases);

    let mut accept_loops = Vec::new();
    for host in &args.listen {
        let listener = TcpListener::bind((host.as_str(), args.port))
            .await
            .with_context(|| format!("failed to listen on {}:{}", host, args.port))?;
        tracing::info!("Listening on {}:{}", host, args.port);
        accept_loops.push(tokio::spawn(Arc::clone(&server).run(listener)));
    }
    for accept_loop in accept_loops {
        accept_loop.await?;
    }
    Ok(())
}
