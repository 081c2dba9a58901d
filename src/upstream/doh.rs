//! DNS over HTTPS (DOH) client implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use reqwest::{Client, Url};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

use super::Exchange;

const DNS_MESSAGE: &str = "application/dns-message";

/// Bound on one HTTP request. POST and the GET fallback must both fit
/// inside `EXCHANGE_TIMEOUT`.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);

/// DNS over HTTPS client
pub struct DohClient {
    url: Url,
    client: Client,
}

impl DohClient {
    /// Create a new DOH client
    pub fn new(url: Url) -> Result<Self> {
        Self::with_bootstrap(url, None)
    }

    /// Create a DOH client, optionally pinning the URL host to a fixed address
    pub fn with_bootstrap(url: Url, bootstrap: Option<SocketAddr>) -> Result<Self> {
        if url.scheme() != "https" {
            anyhow::bail!("DOH URL must use https: {}", url);
        }
        let host = url
            .host_str()
            .with_context(|| format!("DOH URL has no host: {}", url))?
            .to_string();

        let mut builder = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .use_rustls_tls();

        if let Some(addr) = bootstrap {
            debug!("DOH client for {} bootstrapped to {}", host, addr);
            builder = builder.resolve(&host, addr);
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self { url, client })
    }

    /// Send query using GET method (RFC 8484)
    async fn query_get(&self, wire_format: &[u8]) -> Result<Message> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("dns", &URL_SAFE_NO_PAD.encode(wire_format));
        trace!("DOH GET request to {}", url);

        let response = self
            .client
            .get(url)
            .header("Accept", DNS_MESSAGE)
            .send()
            .await
            .context("DOH GET request failed")?;

        Self::read_response(response).await
    }

    /// Send query using POST method (RFC 8484)
    async fn query_post(&self, wire_format: Vec<u8>) -> Result<Message> {
        trace!("DOH POST request to {} ({} bytes)", self.url, wire_format.len());

        let response = self
            .client
            .post(self.url.clone())
            .header("Content-Type", DNS_MESSAGE)
            .header("Accept", DNS_MESSAGE)
            .body(wire_format)
            .send()
            .await
            .context("DOH POST request failed")?;

        Self::read_response(response).await
    }

    async fn read_response(response: reqwest::Response) -> Result<Message> {
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("DOH server returned error status: {}", status);
        }

        let body = response.bytes().await.context("Failed to read DOH response body")?;
        Message::from_bytes(&body).context("Failed to parse DOH response")
    }
}

#[async_trait]
impl Exchange for DohClient {
    async fn exchange(&self, message: &Message) -> Result<Message> {
        let wire_format = message.to_vec()?;

        // Try POST first (more reliable for larger queries), fall back to GET
        match self.query_post(wire_format.clone()).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                debug!("DOH POST to {} failed, trying GET: {:#}", self.url, e);
                self.query_get(&wire_format).await
            }
        }
    }
}
