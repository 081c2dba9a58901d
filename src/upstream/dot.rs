//! DNS over TLS (DOT) client implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

use super::tcp::exchange_framed;
use super::{Endpoint, Exchange};

/// DNS over TLS client
pub struct DotClient {
    endpoint: Endpoint,
    server_name: ServerName<'static>,
    tls_connector: TlsConnector,
}

impl DotClient {
    /// Create a DOT client that verifies the certificate against the endpoint host
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let hostname = endpoint.host.clone();
        Self::with_hostname(endpoint, hostname)
    }

    /// Create a DOT client that connects to `endpoint` but verifies `hostname`
    pub fn with_hostname(endpoint: Endpoint, hostname: String) -> Result<Self> {
        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|_| anyhow::anyhow!("Invalid TLS server name: {}", hostname))?;

        // Build TLS config with default root certificates
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .context("Failed to configure TLS protocol versions")?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            endpoint,
            server_name,
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }
}

#[async_trait]
impl Exchange for DotClient {
    async fn exchange(&self, message: &Message) -> Result<Message> {
        let addr = self.endpoint.resolve().await?;

        trace!("Connecting to DOT server {} ({})", self.endpoint, addr);
        let tcp_stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to DOT server {}", self.endpoint))?;

        let mut tls_stream = self
            .tls_connector
            .connect(self.server_name.clone(), tcp_stream)
            .await
            .context("TLS handshake failed")?;

        exchange_framed(&mut tls_stream, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::test_support::create_test_query;

    #[test]
    fn test_ip_server_name_accepted() {
        assert!(DotClient::new(Endpoint::new("1.1.1.1", 853)).is_ok());
    }

    #[test]
    fn test_invalid_server_name_rejected() {
        assert!(DotClient::with_hostname(
            Endpoint::new("9.9.9.9", 853),
            "not a hostname".to_string()
        )
        .is_err());
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_dot_quad9() {
        let client = DotClient::with_hostname(
            Endpoint::new("9.9.9.9", 853),
            "dns.quad9.net".to_string(),
        )
        .unwrap();

        let response = client.exchange(&create_test_query("example.com.")).await.unwrap();

        assert!(!response.answers().is_empty());
    }
}
