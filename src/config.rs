//! Configuration file structures and parsing for pure-dns.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directories searched for `config.toml` when no path is given on the command line
const CONFIG_DIRS: &[&str] = &["/etc/pure-dns", "."];
const CONFIG_FILE: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstreams raced against each other for every query
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

/// Listener and resolution settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Transport the listener accepts queries on
    #[serde(default)]
    pub net: ListenNet,
    /// Address to listen on (e.g., "0.0.0.0:53")
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Per-query deadline in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Append a `dns.provider.` TXT record naming the winning upstream
    #[serde(default = "default_provider_record")]
    pub provider_record: bool,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_timeout() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_provider_record() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            net: ListenNet::default(),
            listen: default_listen(),
            timeout: default_timeout(),
            log_level: default_log_level(),
            provider_record: default_provider_record(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Listener transport
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenNet {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for ListenNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenNet::Udp => f.write_str("udp"),
            ListenNet::Tcp => f.write_str("tcp"),
        }
    }
}

/// One upstream resolver
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub net: Network,
    /// `host:port` for plain and TLS upstreams, the URL body for the others
    /// (e.g., "dns.google/dns-query" for https, the stamp for sdns)
    pub address: String,
    #[serde(default)]
    pub mode: Mode,
}

impl UpstreamConfig {
    #[cfg(test)]
    pub fn new(net: Network, address: impl Into<String>, mode: Mode) -> Self {
        Self {
            net,
            address: address.into(),
            mode,
        }
    }

    /// `net://address`, used in logs and in the provider record
    pub fn label(&self) -> String {
        format!("{}://{}", self.net, self.address)
    }
}

/// Upstream network kind
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Hash)]
pub enum Network {
    #[default]
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tcp-tls", alias = "tls")]
    Tls,
    #[serde(rename = "https")]
    Https,
    #[serde(rename = "quic")]
    Quic,
    #[serde(rename = "sdns")]
    Sdns,
}

impl Network {
    /// Scheme of the upstream URL form (`tcp-tls` is spelled `tls` there)
    pub fn scheme(&self) -> &'static str {
        match self {
            Network::Udp => "udp",
            Network::Tcp => "tcp",
            Network::Tls => "tls",
            Network::Https => "https",
            Network::Quic => "quic",
            Network::Sdns => "sdns",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tls => f.write_str("tcp-tls"),
            other => f.write_str(other.scheme()),
        }
    }
}

/// How an upstream's transport is chosen
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Plain and TLS upstreams use the direct clients, the rest go through the URL form
    #[default]
    Hybrid,
    /// Every upstream goes through the URL form
    #[serde(alias = "dnsproxy")]
    Unified,
}

impl Config {
    /// Pick the config file: the explicit path, or the first `config.toml`
    /// found in the search directories
    pub fn locate(explicit: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path);
        }

        CONFIG_DIRS
            .iter()
            .map(|dir| Path::new(dir).join(CONFIG_FILE))
            .find(|path| path.is_file())
            .with_context(|| {
                format!(
                    "No {} found in {:?} and no --config given",
                    CONFIG_FILE, CONFIG_DIRS
                )
            })
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.server.timeout == 0 {
            anyhow::bail!("server.timeout must be greater than 0");
        }

        for (idx, upstream) in self.upstreams.iter().enumerate() {
            if upstream.address.trim().is_empty() {
                anyhow::bail!("Upstream #{} ({}) has an empty address", idx + 1, upstream.net);
            }
        }

        Ok(())
    }
}
