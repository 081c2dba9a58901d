//! DNS over QUIC (DOQ) client implementation (RFC 9250).
//!
//! Each exchange opens a fresh QUIC connection, sends the query on the first
//! client-initiated bidirectional stream with a 2-byte length prefix, reads
//! the framed reply, and closes the connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::trace;

use super::{Endpoint, Exchange, EXCHANGE_TIMEOUT};

const DOQ_ALPN: &[u8] = b"doq";
const MAX_DATAGRAM_SIZE: usize = 1350;
const QUERY_STREAM: u64 = 0;
/// DOQ_NO_ERROR
const NO_ERROR: u64 = 0;

/// DNS over QUIC client
pub struct DoqClient {
    endpoint: Endpoint,
    server_name: String,
}

impl DoqClient {
    /// Create a DOQ client that verifies the certificate against the endpoint host
    pub fn new(endpoint: Endpoint) -> Self {
        let server_name = endpoint.host.clone();
        Self::with_hostname(endpoint, server_name)
    }

    /// Create a DOQ client that connects to `endpoint` but verifies `hostname`
    pub fn with_hostname(endpoint: Endpoint, server_name: String) -> Self {
        Self {
            endpoint,
            server_name,
        }
    }

    fn quic_config() -> Result<quiche::Config> {
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
        config.set_application_protos(&[DOQ_ALPN])?;
        config.verify_peer(true);
        config.set_max_idle_timeout(EXCHANGE_TIMEOUT.as_millis() as u64);
        config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(1_000_000);
        config.set_initial_max_stream_data_bidi_local(1_000_000);
        config.set_initial_max_stream_data_bidi_remote(1_000_000);
        config.set_initial_max_streams_bidi(16);
        config.set_initial_max_streams_uni(16);
        config.set_disable_active_migration(true);
        Ok(config)
    }
}

/// Flush every pending QUIC packet to the socket
async fn flush(conn: &mut quiche::Connection, socket: &UdpSocket, out: &mut [u8]) -> Result<()> {
    loop {
        match conn.send(out) {
            Ok((written, send_info)) => {
                socket.send_to(&out[..written], send_info.to).await?;
            }
            Err(quiche::Error::Done) => return Ok(()),
            Err(e) => return Err(e).context("QUIC send failed"),
        }
    }
}

/// Frame the query for a DOQ stream; the message ID must be 0 on the wire
fn frame_query(message: &Message) -> Result<Vec<u8>> {
    let mut message = message.clone();
    message.set_id(0);
    let wire_format = message.to_vec()?;
    let len = u16::try_from(wire_format.len()).context("DNS message too large for DOQ framing")?;

    let mut framed = Vec::with_capacity(wire_format.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&wire_format);
    Ok(framed)
}

/// Parse the framed reply once the stream has been fully received
fn parse_reply(buf: &[u8]) -> Result<Message> {
    if buf.len() < 2 {
        anyhow::bail!("DOQ reply shorter than its length prefix");
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let body = buf
        .get(2..2 + len)
        .context("DOQ reply shorter than announced")?;
    Message::from_bytes(body).context("Failed to parse DOQ response")
}

#[async_trait]
impl Exchange for DoqClient {
    async fn exchange(&self, message: &Message) -> Result<Message> {
        let peer = self.endpoint.resolve().await?;
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        let local = socket.local_addr()?;

        let mut config = Self::quic_config()?;
        let scid_bytes: [u8; quiche::MAX_CONN_ID_LEN] = rand::random();
        let scid = quiche::ConnectionId::from_ref(&scid_bytes);
        let mut conn = quiche::connect(Some(&self.server_name), &scid, local, peer, &mut config)
            .context("Failed to start QUIC connection")?;

        trace!("Connecting to DOQ server {} ({})", self.endpoint, peer);

        let framed = frame_query(message)?;
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut buf = vec![0u8; 65535];
        let mut reply = Vec::new();
        let mut query_sent = false;

        flush(&mut conn, &socket, &mut out).await?;

        loop {
            let wait = conn.timeout().unwrap_or(Duration::from_millis(100));
            match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
                Ok(received) => {
                    let (len, from) = received?;
                    let info = quiche::RecvInfo { from, to: local };
                    match conn.recv(&mut buf[..len], info) {
                        Ok(_) | Err(quiche::Error::Done) => {}
                        Err(e) => return Err(e).context("QUIC receive failed"),
                    }
                }
                Err(_) => conn.on_timeout(),
            }

            if conn.is_closed() {
                anyhow::bail!(
                    "DOQ connection to {} closed before a reply (peer error: {:?})",
                    self.endpoint,
                    conn.peer_error()
                );
            }

            if conn.is_established() && !query_sent {
                let written = conn
                    .stream_send(QUERY_STREAM, &framed, true)
                    .context("Failed to send DOQ query")?;
                if written < framed.len() {
                    anyhow::bail!("DOQ stream accepted only {} of {} bytes", written, framed.len());
                }
                query_sent = true;
                trace!("Sent DOQ query ({} bytes)", framed.len());
            }

            let mut finished = false;
            for stream_id in conn.readable() {
                loop {
                    match conn.stream_recv(stream_id, &mut buf) {
                        Ok((read, fin)) => {
                            if stream_id == QUERY_STREAM {
                                reply.extend_from_slice(&buf[..read]);
                                finished |= fin;
                            }
                            if fin {
                                break;
                            }
                        }
                        Err(quiche::Error::Done) => break,
                        Err(e) => return Err(e).context("Failed to read DOQ stream"),
                    }
                }
            }

            if finished {
                trace!("Received DOQ response ({} bytes)", reply.len());
                // Best effort close, the reply is already in hand
                let _ = conn.close(true, NO_ERROR, b"");
                let _ = flush(&mut conn, &socket, &mut out).await;

                let mut response = parse_reply(&reply)?;
                response.set_id(message.id());
                return Ok(response);
            }

            flush(&mut conn, &socket, &mut out).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::test_support::{answer_for, create_test_query};

    #[test]
    fn test_frame_query_zeroes_id() {
        let framed = frame_query(&create_test_query("example.com.")).unwrap();
        let len = u16::from_be_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(len, framed.len() - 2);

        let decoded = Message::from_bytes(&framed[2..]).unwrap();
        assert_eq!(decoded.id(), 0);
        assert_eq!(decoded.queries().len(), 1);
    }

    #[test]
    fn test_parse_reply() {
        let response = answer_for(&create_test_query("example.com."), [10, 0, 0, 1]);
        let wire_format = response.to_vec().unwrap();
        let mut framed = (wire_format.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&wire_format);

        let parsed = parse_reply(&framed).unwrap();
        assert_eq!(parsed.answers().len(), 1);
    }

    #[test]
    fn test_parse_truncated_reply() {
        assert!(parse_reply(&[0]).is_err());
        assert!(parse_reply(&[0, 40, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_quic_config_builds() {
        assert!(DoqClient::quic_config().is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_doq_adguard() {
        let client = DoqClient::new(Endpoint::new("dns.adguard-dns.com", 853));

        let response = client.exchange(&create_test_query("example.com.")).await.unwrap();

        assert!(!response.answers().is_empty());
    }
}
