//! Plain DNS over TCP client, plus the length-prefixed framing shared with DOT.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use super::{Endpoint, Exchange};

/// Write one length-prefixed DNS message and read one back (RFC 1035 4.2.2)
pub(super) async fn exchange_framed<S>(stream: &mut S, message: &Message) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let wire_format = message.to_vec()?;
    let len = u16::try_from(wire_format.len()).context("DNS message too large for TCP framing")?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&wire_format).await?;
    stream.flush().await?;

    trace!("Sent framed query ({} bytes)", wire_format.len());

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let response_len = u16::from_be_bytes(len_buf) as usize;

    let mut response_buf = vec![0u8; response_len];
    stream.read_exact(&mut response_buf).await?;

    trace!("Received framed response ({} bytes)", response_len);

    Message::from_bytes(&response_buf).context("Failed to parse DNS response")
}

/// DNS over TCP client
pub struct TcpClient {
    endpoint: Endpoint,
}

impl TcpClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Exchange for TcpClient {
    async fn exchange(&self, message: &Message) -> Result<Message> {
        let addr = self.endpoint.resolve().await?;
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.endpoint))?;

        exchange_framed(&mut stream, message).await
    }
}
