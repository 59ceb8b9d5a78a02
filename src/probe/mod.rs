//! The probe contract shared by every protocol, and the simple protocol
//! probes built on it.

pub mod dns;
pub mod http;
pub mod quic;
pub mod tcp;
pub mod tls;

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::PingError;

pub use dns::{DnsProbe, DnsTransport};
pub use http::HttpProbe;
pub use quic::QuicProbe;
pub use tcp::TcpProbe;
pub use tls::{TlsProbe, TlsVersion};

/// Outcome of one round.
pub type PingResult = Result<Reply, PingError>;

/// A configured network operation that can be repeated round after round.
#[async_trait]
pub trait Probe: Send {
    /// Run one round. Returns promptly with [`PingError::Cancelled`] once
    /// `cancel` fires.
    async fn ping_context(&mut self, cancel: &CancellationToken) -> PingResult;

    /// Run one round that cannot be cancelled.
    async fn ping(&mut self) -> PingResult {
        self.ping_context(&CancellationToken::new()).await
    }
}

/// A successful round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Address that answered.
    pub peer: IpAddr,
    pub time: Duration,
    pub detail: Detail,
}

/// Protocol specific metadata of a successful round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detail {
    Tcp,
    Tls {
        connection: Duration,
        handshake: Duration,
        version: String,
    },
    Http {
        protocol: String,
        status: u16,
        length: usize,
    },
    Dns {
        answers: usize,
        rcode: String,
    },
    Quic {
        alpn: Option<String>,
        tls: String,
    },
    Icmp {
        ttl: Option<u8>,
    },
}

impl Reply {
    pub fn new(peer: IpAddr, time: Duration, detail: Detail) -> Self {
        Self { peer, time, detail }
    }

    /// Elapsed whole milliseconds, truncated.
    pub fn millis(&self) -> u64 {
        millis(self.time)
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.peer)?;
        match &self.detail {
            Detail::Tcp => {}
            Detail::Tls {
                connection,
                handshake,
                version,
            } => write!(
                f,
                "protocol={}, connection={} ms, handshake={} ms, ",
                version,
                millis(*connection),
                millis(*handshake)
            )?,
            Detail::Http {
                protocol,
                status,
                length,
            } => write!(f, "protocol={}, status={}, length={}, ", protocol, status, length)?,
            Detail::Dns { answers, rcode } => write!(f, "rcode={}, answers={}, ", rcode, answers)?,
            Detail::Quic { alpn, tls } => write!(
                f,
                "alpn={}, tls={}, ",
                alpn.as_deref().unwrap_or("none"),
                tls
            )?,
            Detail::Icmp { .. } => {}
        }
        write!(f, "time={} ms", self.millis())?;
        if let Detail::Icmp { ttl: Some(ttl) } = self.detail {
            write!(f, ", TTL={}", ttl)?;
        }
        Ok(())
    }
}

/// Line printed for a round, success or failure.
pub fn describe(result: &PingResult) -> String {
    match result {
        Ok(reply) => reply.to_string(),
        Err(e) => e.to_string(),
    }
}

/// Race `fut` against `cancel`.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, PingError>
where
    F: Future<Output = Result<T, PingError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PingError::Cancelled),
        result = fut => result,
    }
}

/// Race `fut` against `cancel` and a `timeout` deadline.
pub(crate) async fn bounded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<T, PingError>
where
    F: Future<Output = Result<T, PingError>>,
{
    cancellable(cancel, async {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PingError::Timeout),
        }
    })
    .await
}
