//! UDP/TCP DNS server implementation.

use anyhow::{Context, Result};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::config::ListenNet;
use crate::race::Resolver;
use crate::reply::empty_reply;

/// DNS server that answers every query through the resolver race
pub struct DnsServer {
    net: ListenNet,
    listen: SocketAddr,
    resolver: Arc<Resolver>,
}

impl DnsServer {
    pub fn new(net: ListenNet, listen: SocketAddr, resolver: Arc<Resolver>) -> Self {
        Self {
            net,
            listen,
            resolver,
        }
    }

    /// Bind the listener and serve until an unrecoverable error
    pub async fn run(self) -> Result<()> {
        info!("Starting DNS server on {}://{}", self.net, self.listen);

        match self.net {
            ListenNet::Udp => {
                let socket = UdpSocket::bind(self.listen)
                    .await
                    .with_context(|| format!("Failed to bind UDP socket on {}", self.listen))?;
                serve_udp(Arc::new(socket), self.resolver).await
            }
            ListenNet::Tcp => {
                let listener = TcpListener::bind(self.listen)
                    .await
                    .with_context(|| format!("Failed to bind TCP listener on {}", self.listen))?;
                serve_tcp(listener, self.resolver).await
            }
        }
    }
}

/// Serve DNS over an already bound UDP socket, one task per datagram
async fn serve_udp(socket: Arc<UdpSocket>, resolver: Arc<Resolver>) -> Result<()> {
    let addr = socket.local_addr()?;
    let mut buf = vec![0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let data = buf[..len].to_vec();
                let socket = socket.clone();
                let resolver = resolver.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_udp_query(&socket, src, &data, &resolver).await {
                        warn!("Failed to handle UDP query from {}: {}", src, e);
                    }
                });
            }
            Err(e) => {
                error!("UDP recv error on {}: {}", addr, e);
            }
        }
    }
}

/// Serve DNS over an already bound TCP listener, one task per connection
async fn serve_tcp(listener: TcpListener, resolver: Arc<Resolver>) -> Result<()> {
    let addr = listener.local_addr()?;
    loop {
        match listener.accept().await {
            Ok((stream, src)) => {
                let resolver = resolver.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_tcp_connection(stream, src, &resolver).await {
                        warn!("Failed to handle TCP connection from {}: {}", src, e);
                    }
                });
            }
            Err(e) => {
                error!("TCP accept error on {}: {}", addr, e);
            }
        }
    }
}

/// Race the query and log how it ended
async fn answer(request: &Message, resolver: &Resolver) -> Message {
    let outcome = resolver.resolve(request).await;
    match &outcome.upstream {
        Some(upstream) => debug!("Query {} answered by {}", request.id(), upstream),
        None => debug!("Query {} got an empty reply (won: {})", request.id(), outcome.won),
    }
    outcome.response
}

/// Wire form of the reply to `request`. A reply that cannot be encoded is
/// replaced by the empty reply so the client still hears back.
fn encode_reply(response: &Message, request: &Message) -> Result<Vec<u8>> {
    match response.to_vec() {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            warn!("Failed to encode reply to query {}, answering empty: {}", request.id(), e);
            Ok(empty_reply(request).to_vec()?)
        }
    }
}

/// Handle a single UDP DNS query
async fn handle_udp_query(
    socket: &UdpSocket,
    src: SocketAddr,
    data: &[u8],
    resolver: &Resolver,
) -> Result<()> {
    debug!("Received UDP query from {} ({} bytes)", src, data.len());

    let request = match Message::from_bytes(data) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to parse DNS message from {}: {}", src, e);
            return Ok(());
        }
    };

    let response = answer(&request, resolver).await;

    let response_bytes = encode_reply(&response, &request)?;
    socket.send_to(&response_bytes, src).await?;

    debug!("Sent UDP response to {} ({} bytes)", src, response_bytes.len());
    Ok(())
}

/// Handle a TCP DNS connection (may contain multiple queries)
async fn handle_tcp_connection(
    mut stream: TcpStream,
    src: SocketAddr,
    resolver: &Resolver,
) -> Result<()> {
    debug!("TCP connection from {}", src);

    loop {
        // Read the 2-byte length prefix
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Client closed connection
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            warn!("Invalid DNS message length from {}: {}", src, len);
            break;
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        let request = match Message::from_bytes(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to parse DNS message from {}: {}", src, e);
                continue;
            }
        };

        let response = answer(&request, resolver).await;

        let response_bytes = encode_reply(&response, &request)?;
        let len_bytes = u16::try_from(response_bytes.len())
            .context("DNS response too large for TCP framing")?
            .to_be_bytes();

        stream.write_all(&len_bytes).await?;
        stream.write_all(&response_bytes).await?;

        debug!("Sent TCP response to {} ({} bytes)", src, response_bytes.len());
    }

    Ok(())
}
