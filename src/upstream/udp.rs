//! Plain DNS over UDP client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::trace;

use super::{Endpoint, Exchange};

/// DNS over UDP client
pub struct UdpClient {
    endpoint: Endpoint,
}

impl UdpClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Exchange for UdpClient {
    async fn exchange(&self, message: &Message) -> Result<Message> {
        let addr = self.endpoint.resolve().await?;
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind).await?;
        socket
            .connect(addr)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", self.endpoint))?;

        let wire_format = message.to_vec()?;
        socket.send(&wire_format).await?;
        trace!("Sent UDP query to {} ({} bytes)", addr, wire_format.len());

        let mut buf = vec![0u8; 65535];
        loop {
            let len = socket.recv(&mut buf).await?;
            let response = match Message::from_bytes(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    trace!("Ignoring malformed datagram from {}: {}", addr, e);
                    continue;
                }
            };

            // Stray datagrams for other queries are skipped
            if response.id() == message.id() {
                trace!("Received UDP response from {} ({} bytes)", addr, len);
                return Ok(response);
            }
        }
    }
}
