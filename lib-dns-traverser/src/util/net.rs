use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use hickory_proto::ProtoError;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// An error from one exchange with one server.
///
/// These never abort a traversal: the classifier folds them into the outcome
/// distribution.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("no response within the retry budget")]
    Timeout,

    #[error("could not decode response: {0}")]
    Decode(ProtoError),

    #[error("could not encode request: {0}")]
    Encode(ProtoError),

    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u16, got: u16 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The transport seam: send one request to one server, get one decoded
/// response back.
///
/// The real implementation is `WireExchanger`; tests use the recorded
/// `test_util::FixtureExchanger`.  Retry and truncation policy live behind
/// this trait so the engine sees exactly one exchange per query.
#[async_trait]
pub trait Exchanger: Send + Sync {
    async fn exchange(&self, server: SocketAddr, request: &Message)
        -> Result<Message, ExchangeError>;
}

/// UDP-then-TCP exchange against real servers.
#[derive(Debug, Clone)]
pub struct WireExchanger {
    /// Per-attempt timeout.
    timeout: Duration,
    /// Total send attempts; only timeouts are retried.
    retries: usize,
    /// Receive buffer size; also the advertised EDNS0 payload.
    udp_size: u16,
    /// Retry over TCP when a response comes back truncated.
    allow_tcp: bool,
    /// Skip UDP entirely.
    always_tcp: bool,
}

impl WireExchanger {
    pub fn new(
        timeout: Duration,
        retries: usize,
        udp_size: u16,
        allow_tcp: bool,
        always_tcp: bool,
    ) -> Self {
        WireExchanger {
            timeout,
            retries: retries.max(1),
            udp_size,
            // a forced-TCP exchange is trivially an allowed one
            allow_tcp: allow_tcp || always_tcp,
            always_tcp,
        }
    }

    /// An exchanger honouring a traversal configuration's transport fields.
    pub fn from_config(config: &crate::traverse::TraverseConfig) -> Self {
        WireExchanger::new(
            config.timeout,
            config.retries,
            config.udp_size,
            config.allow_tcp,
            config.always_tcp,
        )
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        request: &[u8],
    ) -> Result<Message, ExchangeError> {
        match timeout(self.timeout, self.exchange_udp_notimeout(server, request)).await {
            Ok(res) => res,
            Err(_) => Err(ExchangeError::Timeout),
        }
    }

    /// Timeout-less version of `exchange_udp`.
    async fn exchange_udp_notimeout(
        &self,
        server: SocketAddr,
        request: &[u8],
    ) -> Result<Message, ExchangeError> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };

        let sock = UdpSocket::bind(bind_addr).await?;
        sock.connect(server).await?;
        sock.send(request).await?;

        let mut buf = vec![0u8; usize::from(self.udp_size.max(512))];
        let len = sock.recv(&mut buf).await?;
        Message::from_vec(&buf[..len]).map_err(ExchangeError::Decode)
    }

    async fn exchange_tcp(
        &self,
        server: SocketAddr,
        request: &[u8],
    ) -> Result<Message, ExchangeError> {
        match timeout(self.timeout, self.exchange_tcp_notimeout(server, request)).await {
            Ok(res) => res,
            Err(_) => Err(ExchangeError::Timeout),
        }
    }

    /// Timeout-less version of `exchange_tcp`.
    async fn exchange_tcp_notimeout(
        &self,
        server: SocketAddr,
        request: &[u8],
    ) -> Result<Message, ExchangeError> {
        let mut stream = TcpStream::connect(server).await?;
        send_tcp_bytes(&mut stream, request).await?;
        let bytes = read_tcp_bytes(&mut stream).await?;
        Message::from_vec(&bytes).map_err(ExchangeError::Decode)
    }
}

#[async_trait]
impl Exchanger for WireExchanger {
    async fn exchange(
        &self,
        server: SocketAddr,
        request: &Message,
    ) -> Result<Message, ExchangeError> {
        let bytes = serialise(request)?;

        let mut last_err = ExchangeError::Timeout;
        for attempt in 0..self.retries {
            let result = if self.always_tcp {
                self.exchange_tcp(server, &bytes).await
            } else {
                self.exchange_udp(server, &bytes).await
            };

            match result {
                Ok(response) if response.id() != request.id() => {
                    return Err(ExchangeError::IdMismatch {
                        expected: request.id(),
                        got: response.id(),
                    });
                }
                Ok(response) if response.truncated() && !self.always_tcp && self.allow_tcp => {
                    tracing::debug!(%server, "truncated response, retrying over tcp");
                    return self.exchange_tcp(server, &bytes).await;
                }
                Ok(response) => return Ok(response),
                Err(ExchangeError::Timeout) => {
                    tracing::trace!(%server, attempt, "timed out");
                    last_err = ExchangeError::Timeout;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err)
    }
}

fn serialise(msg: &Message) -> Result<Vec<u8>, ExchangeError> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    msg.emit(&mut encoder).map_err(ExchangeError::Encode)?;
    Ok(buf)
}

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message carries a big-endian u16 prefix giving the total length
/// of the message, so the entire message can be read before parsing begins.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, io::Error> {
    let size = stream.read_u16().await?;
    let expected = usize::from(size);
    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        let read = stream.read_buf(&mut bytes).await?;
        if read == 0 && bytes.len() < expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {expected} bytes but got {}", bytes.len()),
            ));
        }
    }
    Ok(bytes)
}

/// Write a serialised message to a TCP stream, with the two-byte length
/// prefix.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), io::Error> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too long for tcp"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    Ok(())
}
