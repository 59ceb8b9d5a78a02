use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::tcp::connect;
use super::tls::{client_config, server_name};
use super::{bounded, cancellable, Detail, PingResult, Probe, Reply};
use crate::error::PingError;
use crate::resolver::Target;

/// How the query travels to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DnsTransport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl DnsTransport {
    pub fn default_port(self) -> u16 {
        match self {
            DnsTransport::Udp | DnsTransport::Tcp => 53,
            DnsTransport::Tls => 853,
        }
    }
}

impl fmt::Display for DnsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsTransport::Udp => "udp",
            DnsTransport::Tcp => "tcp",
            DnsTransport::Tls => "tcp-tls",
        })
    }
}

/// Times one DNS query and validates the answer belongs to it.
#[derive(Debug)]
pub struct DnsProbe {
    target: Target,
    port: u16,
    timeout: Duration,
    transport: DnsTransport,
    question: Query,
    tls: Option<Arc<ClientConfig>>,
}

impl DnsProbe {
    /// `port` 0 selects the transport's well-known port. `domain` is made
    /// fully qualified.
    pub fn new(
        target: Target,
        port: u16,
        timeout: Duration,
        transport: DnsTransport,
        record_type: &str,
        domain: &str,
        insecure: bool,
    ) -> Result<Self, PingError> {
        let record_type = RecordType::from_str(&record_type.to_ascii_uppercase())
            .map_err(|_| PingError::protocol(format!("unknown record type {:?}", record_type)))?;
        let mut name = Name::from_ascii(domain).map_err(PingError::protocol)?;
        name.set_fqdn(true);

        let tls = match transport {
            DnsTransport::Tls => Some(client_config(None, insecure, &[])?),
            _ => None,
        };
        let port = if port == 0 {
            transport.default_port()
        } else {
            port
        };

        Ok(Self {
            target,
            port,
            timeout,
            transport,
            question: Query::query(name, record_type),
            tls,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn query(&self) -> Message {
        let mut msg = Message::new();
        msg.set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(self.question.clone());
        msg
    }

    async fn exchange(
        &self,
        cancel: &CancellationToken,
        addr: SocketAddr,
        query: &Message,
    ) -> Result<Message, PingError> {
        let request = query.to_vec().map_err(PingError::protocol)?;
        match self.transport {
            DnsTransport::Udp => exchange_udp(addr, &request, query.id()).await,
            DnsTransport::Tcp => {
                let mut stream = connect(cancel, addr, self.timeout).await?;
                exchange_stream(&mut stream, &request).await
            }
            DnsTransport::Tls => {
                let stream = connect(cancel, addr, self.timeout).await?;
                let config = self
                    .tls
                    .clone()
                    .ok_or(PingError::Unsupported("dns-over-tls is not configured"))?;
                let mut stream = TlsConnector::from(config)
                    .connect(server_name(self.target.host())?, stream)
                    .await
                    .map_err(PingError::handshake)?;
                exchange_stream(&mut stream, &request).await
            }
        }
    }
}

async fn exchange_udp(addr: SocketAddr, request: &[u8], id: u16) -> Result<Message, PingError> {
    let local: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
    socket.connect(addr).await?;
    socket.send(request).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = socket.recv(&mut buf).await?;
        match Message::from_vec(&buf[..n]) {
            Ok(response) if response.id() == id => return Ok(response),
            Ok(response) => debug!("dropping dns response with foreign id {}", response.id()),
            Err(e) => debug!("dropping malformed dns datagram: {}", e),
        }
    }
}

/// RFC 1035 stream framing: a 2-byte length before each message.
async fn exchange_stream<S>(stream: &mut S, request: &[u8]) -> Result<Message, PingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(request.len()).map_err(PingError::protocol)?;
    let mut framed = Vec::with_capacity(request.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(request);
    stream.write_all(&framed).await?;
    stream.flush().await?;

    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Message::from_vec(&buf).map_err(PingError::protocol)
}

/// Checks `response` answers `query` and reports success.
fn validate(query: &Message, response: &Message) -> Result<(), PingError> {
    if response.id() != query.id() {
        return Err(PingError::protocol(format!(
            "response id {} does not match query id {}",
            response.id(),
            query.id()
        )));
    }
    if response.message_type() != MessageType::Response {
        return Err(PingError::protocol("response error: not a response"));
    }
    if response.op_code() != OpCode::Query {
        return Err(PingError::protocol(format!(
            "response error: unexpected opcode {:?}",
            response.op_code()
        )));
    }
    if response.queries() != query.queries() {
        return Err(PingError::protocol("response error: question mismatch"));
    }
    if response.response_code() != ResponseCode::NoError {
        return Err(PingError::protocol(format!(
            "response error: {}",
            response.response_code()
        )));
    }
    Ok(())
}

#[async_trait]
impl Probe for DnsProbe {
    async fn ping_context(&mut self, cancel: &CancellationToken) -> PingResult {
        let ip = cancellable(cancel, self.target.address()).await?;
        let addr = SocketAddr::new(ip, self.port);
        let query = self.query();

        let started = Instant::now();
        let response = bounded(cancel, self.timeout, self.exchange(cancel, addr, &query)).await?;
        let elapsed = started.elapsed();
        validate(&query, &response)?;

        debug!("{} query to {} answered in {:?}", self.transport, addr, elapsed);
        Ok(Reply::new(
            ip,
            elapsed,
            Detail::Dns {
                answers: response.answers().len(),
                rcode: response.response_code().to_string(),
            },
        ))
    }
}
