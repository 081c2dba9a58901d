//! Upstream DNS clients and the per-upstream worker that drives them.

mod doh;
mod doq;
mod dot;
mod stamp;
mod tcp;
mod udp;
mod url;

pub use doh::DohClient;
pub use doq::DoqClient;
pub use dot::DotClient;
pub use tcp::TcpClient;
pub use udp::UdpClient;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{Mode, Network, UpstreamConfig};

/// Upper bound on a single exchange with one upstream
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Query names and addresses are cut to this many characters in logs
const LOG_FIELD_LEN: usize = 20;

/// Trait for upstream DNS transports
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Send a DNS query and receive the response
    async fn exchange(&self, message: &Message) -> Result<Message>;
}

/// Host and port of a remote server. The host may be a name, resolved on every exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 address
    pub fn parse(address: &str, default_port: u16) -> Result<Self> {
        let address = address.trim();

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .with_context(|| format!("Unterminated IPv6 address '{}'", address))?;
            let port = match tail {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .with_context(|| format!("Invalid address '{}'", address))?,
                ),
            };
            (host, port)
        } else if address.parse::<Ipv6Addr>().is_ok() {
            (address, None)
        } else {
            match address.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            }
        };

        if host.is_empty() {
            anyhow::bail!("Address '{}' has no host", address);
        }

        let port = match port {
            Some(port) => port
                .parse()
                .with_context(|| format!("Invalid port in address '{}'", address))?,
            None => default_port,
        };

        Ok(Self::new(host, port))
    }

    /// Resolve to a socket address, preferring the first record the system returns
    pub async fn resolve(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to resolve {}", self))?
            .next()
            .with_context(|| format!("No addresses found for {}", self))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Plain and TLS transports that take a `host:port` address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectNet {
    Udp,
    Tcp,
    Tls,
}

/// How an upstream reaches its server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Dedicated client for a `host:port` address
    Direct(DirectNet),
    /// Address read as `scheme://address`
    Url(Network),
}

impl Transport {
    /// Map a network kind and mode to the transport strategy
    pub fn select(net: Network, mode: Mode) -> Self {
        match (mode, net) {
            (Mode::Unified, net) => Transport::Url(net),
            (Mode::Hybrid, Network::Udp) => Transport::Direct(DirectNet::Udp),
            (Mode::Hybrid, Network::Tcp) => Transport::Direct(DirectNet::Tcp),
            (Mode::Hybrid, Network::Tls) => Transport::Direct(DirectNet::Tls),
            (Mode::Hybrid, net @ (Network::Https | Network::Quic | Network::Sdns)) => {
                Transport::Url(net)
            }
        }
    }

    /// Build the exchanger for `address`
    pub fn open(&self, address: &str) -> Result<Arc<dyn Exchange>> {
        let exchange: Arc<dyn Exchange> = match self {
            Transport::Direct(DirectNet::Udp) => {
                Arc::new(UdpClient::new(Endpoint::parse(address, 53)?))
            }
            Transport::Direct(DirectNet::Tcp) => {
                Arc::new(TcpClient::new(Endpoint::parse(address, 53)?))
            }
            Transport::Direct(DirectNet::Tls) => {
                Arc::new(DotClient::new(Endpoint::parse(address, 853)?)?)
            }
            Transport::Url(net) => url::open(&format!("{}://{}", net.scheme(), address))?,
        };
        Ok(exchange)
    }
}

/// Result of one attempt against one upstream
#[derive(Debug)]
pub struct Attempt {
    /// The upstream's reply, `None` when the attempt failed
    pub response: Option<Message>,
    /// Round trip time, zero for failed attempts
    pub latency: Duration,
}

/// One configured upstream resolver
pub struct Upstream {
    config: UpstreamConfig,
    label: String,
    exchange: Arc<dyn Exchange>,
}

impl Upstream {
    /// Build the upstream and its transport; errors here are configuration errors
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let transport = Transport::select(config.net, config.mode);
        let exchange = transport
            .open(&config.address)
            .with_context(|| format!("Invalid upstream {}", config.label()))?;
        Ok(Self::with_exchange(config, exchange))
    }

    /// Build an upstream around an existing exchanger
    pub fn with_exchange(config: UpstreamConfig, exchange: Arc<dyn Exchange>) -> Self {
        let label = config.label();
        Self {
            config,
            label,
            exchange,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// `net://address`
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Send `query` to this upstream. Never fails: errors and timeouts come
    /// back as an unsuccessful attempt.
    pub async fn attempt(&self, query: &Message) -> Attempt {
        let name = query
            .queries()
            .first()
            .map(|q| q.name().to_string())
            .unwrap_or_else(|| "?".to_string());
        let upstream = format!(
            "{}://{}",
            self.config.net,
            head(&self.config.address, LOG_FIELD_LEN)
        );

        let start = Instant::now();
        let exchange = self.exchange.exchange(query);
        let result = match tokio::time::timeout(EXCHANGE_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("no reply within {:?}", EXCHANGE_TIMEOUT)),
        };

        match result {
            Ok(response) => {
                let latency = start.elapsed();
                info!(
                    "[success] resolve: {} rtt: {:?} upstream: {}",
                    head(&name, LOG_FIELD_LEN),
                    latency,
                    upstream
                );
                Attempt {
                    response: Some(response),
                    latency,
                }
            }
            Err(e) => {
                warn!(
                    "[error] resolve: {} upstream: {} reason: \"{:#}\"",
                    head(&name, LOG_FIELD_LEN),
                    upstream,
                    e
                );
                Attempt {
                    response: None,
                    latency: Duration::ZERO,
                }
            }
        }
    }
}

/// First `n` characters of `s`, with `...` appended when something was cut
fn head(s: &str, n: usize) -> String {
    match s.char_indices().nth(n) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{answer_for, create_test_query};
    use super::*;

    struct Fixed(Option<[u8; 4]>);

    #[async_trait]
    impl Exchange for Fixed {
        async fn exchange(&self, message: &Message) -> Result<Message> {
            match self.0 {
                Some(ip) => Ok(answer_for(message, ip)),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    #[test]
    fn test_transport_selection() {
        use Network::*;

        assert_eq!(Transport::select(Udp, Mode::Hybrid), Transport::Direct(DirectNet::Udp));
        assert_eq!(Transport::select(Tcp, Mode::Hybrid), Transport::Direct(DirectNet::Tcp));
        assert_eq!(Transport::select(Tls, Mode::Hybrid), Transport::Direct(DirectNet::Tls));
        for net in [Https, Quic, Sdns] {
            assert_eq!(Transport::select(net, Mode::Hybrid), Transport::Url(net));
        }
        for net in [Udp, Tcp, Tls, Https, Quic, Sdns] {
            assert_eq!(Transport::select(net, Mode::Unified), Transport::Url(net));
        }
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::parse("1.1.1.1", 53).unwrap(), Endpoint::new("1.1.1.1", 53));
        assert_eq!(Endpoint::parse("1.1.1.1:5353", 53).unwrap(), Endpoint::new("1.1.1.1", 5353));
        assert_eq!(Endpoint::parse("dns.google:853", 53).unwrap(), Endpoint::new("dns.google", 853));
        assert_eq!(Endpoint::parse("[::1]:53", 853).unwrap(), Endpoint::new("::1", 53));
        assert_eq!(Endpoint::parse("[::1]", 853).unwrap(), Endpoint::new("::1", 853));
        assert_eq!(Endpoint::parse("2001:db8::1", 53).unwrap(), Endpoint::new("2001:db8::1", 53));

        assert!(Endpoint::parse("", 53).is_err());
        assert!(Endpoint::parse(":53", 53).is_err());
        assert!(Endpoint::parse("1.1.1.1:dns", 53).is_err());
        assert!(Endpoint::parse("[::1", 53).is_err());
        assert!(Endpoint::parse("[::1]x", 53).is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("::1", 53).to_string(), "[::1]:53");
        assert_eq!(Endpoint::new("1.1.1.1", 53).to_string(), "1.1.1.1:53");
    }

    #[test]
    fn test_head() {
        assert_eq!(head("example.com.", 20), "example.com.");
        assert_eq!(head("a-very-long-subdomain.example.com.", 20), "a-very-long-subdomai...");
        assert_eq!(head("ééééé", 2), "éé...");
    }

    #[test]
    fn test_upstream_new_validates_address() {
        let ok = UpstreamConfig::new(Network::Udp, "1.1.1.1:53", Mode::Hybrid);
        assert!(Upstream::new(ok).is_ok());

        let bad = UpstreamConfig::new(Network::Udp, "1.1.1.1:dns", Mode::Hybrid);
        assert!(Upstream::new(bad).is_err());

        let bad_doh = UpstreamConfig::new(Network::Https, "", Mode::Hybrid);
        assert!(Upstream::new(bad_doh).is_err());
    }

    #[tokio::test]
    async fn test_attempt_success() {
        let config = UpstreamConfig::new(Network::Udp, "192.0.2.1:53", Mode::Hybrid);
        let upstream = Upstream::with_exchange(config, Arc::new(Fixed(Some([10, 0, 0, 1]))));

        let attempt = upstream.attempt(&create_test_query("example.com.")).await;
        assert!(attempt.response.is_some());
        assert_eq!(upstream.label(), "udp://192.0.2.1:53");
    }

    #[tokio::test]
    async fn test_attempt_failure_is_not_an_error() {
        let config = UpstreamConfig::new(Network::Tcp, "192.0.2.1:53", Mode::Hybrid);
        let upstream = Upstream::with_exchange(config, Arc::new(Fixed(None)));

        let attempt = upstream.attempt(&create_test_query("example.com.")).await;
        assert!(attempt.response.is_none());
        assert_eq!(attempt.latency, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_attempt_without_question() {
        let config = UpstreamConfig::new(Network::Udp, "192.0.2.1:53", Mode::Hybrid);
        let upstream = Upstream::with_exchange(config, Arc::new(Fixed(None)));

        let attempt = upstream.attempt(&Message::new()).await;
        assert!(attempt.response.is_none());
    }
}
