//! Upstreams described by an address URL (`udp://`, `tls://`, `https://`,
//! `quic://`, `sdns://`, ...).

use anyhow::{Context, Result};
use reqwest::Url;
use std::net::SocketAddr;
use std::sync::Arc;

use super::stamp::Stamp;
use super::{DohClient, DoqClient, DotClient, Endpoint, Exchange, TcpClient, UdpClient};

const DNS_PORT: u16 = 53;
const TLS_PORT: u16 = 853;
const HTTPS_PORT: u16 = 443;

/// Build the exchanger for an upstream address URL
pub fn open(address: &str) -> Result<Arc<dyn Exchange>> {
    let (scheme, rest) = address
        .split_once("://")
        .with_context(|| format!("Upstream address '{}' has no scheme", address))?;

    let exchange: Arc<dyn Exchange> = match scheme {
        "udp" => Arc::new(UdpClient::new(host_endpoint(rest, DNS_PORT)?)),
        "tcp" => Arc::new(TcpClient::new(host_endpoint(rest, DNS_PORT)?)),
        "tls" => Arc::new(DotClient::new(host_endpoint(rest, TLS_PORT)?)?),
        "https" => {
            let url = Url::parse(address)
                .with_context(|| format!("Invalid DOH URL '{}'", address))?;
            Arc::new(DohClient::new(url)?)
        }
        "quic" => Arc::new(DoqClient::new(host_endpoint(rest, TLS_PORT)?)),
        "sdns" => {
            let stamp = Stamp::parse(rest)
                .with_context(|| format!("Invalid DNS stamp '{}'", address))?;
            from_stamp(stamp)?
        }
        other => anyhow::bail!("Unsupported upstream scheme '{}'", other),
    };

    Ok(exchange)
}

/// Host part of a URL body, ignoring any path
fn host_endpoint(rest: &str, default_port: u16) -> Result<Endpoint> {
    let authority = rest.split('/').next().unwrap_or_default();
    Endpoint::parse(authority, default_port)
}

/// Build the exchanger a stamp describes. A non-empty stamp address is where
/// we connect; the stamp hostname is what the certificate is checked against.
fn from_stamp(stamp: Stamp) -> Result<Arc<dyn Exchange>> {
    let exchange: Arc<dyn Exchange> = match stamp {
        Stamp::Plain { addr } => Arc::new(UdpClient::new(Endpoint::parse(&addr, DNS_PORT)?)),
        Stamp::Https {
            addr,
            hostname,
            path,
        } => {
            let url = Url::parse(&format!("https://{}{}", hostname, path))
                .with_context(|| format!("Invalid DOH stamp target {}{}", hostname, path))?;
            let bootstrap = if addr.is_empty() {
                None
            } else {
                let port = url.port_or_known_default().unwrap_or(HTTPS_PORT);
                Some(bootstrap_addr(&addr, port)?)
            };
            Arc::new(DohClient::with_bootstrap(url, bootstrap)?)
        }
        Stamp::Tls { addr, hostname } => {
            let (endpoint, server_name) = stamp_target(&addr, &hostname)?;
            Arc::new(DotClient::with_hostname(endpoint, server_name)?)
        }
        Stamp::Quic { addr, hostname } => {
            let (endpoint, server_name) = stamp_target(&addr, &hostname)?;
            Arc::new(DoqClient::with_hostname(endpoint, server_name))
        }
    };

    Ok(exchange)
}

fn stamp_target(addr: &str, hostname: &str) -> Result<(Endpoint, String)> {
    let named = Endpoint::parse(hostname, TLS_PORT)?;
    let endpoint = if addr.is_empty() {
        named.clone()
    } else {
        Endpoint::parse(addr, named.port)?
    };
    Ok((endpoint, named.host))
}

/// Stamp bootstrap addresses are IP literals
fn bootstrap_addr(addr: &str, default_port: u16) -> Result<SocketAddr> {
    let endpoint = Endpoint::parse(addr, default_port)?;
    let ip = endpoint
        .host
        .parse()
        .with_context(|| format!("Stamp address '{}' is not an IP address", addr))?;
    Ok(SocketAddr::new(ip, endpoint.port))
}
