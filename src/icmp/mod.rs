//! ICMP echo probe.
//!
//! The transport is picked once per probe from what the platform offers:
//! raw or datagram sockets on Linux and Darwin, the iphlpapi helper on
//! Windows. Correlation of replies to requests lives in [`engine`] and is
//! shared by the socket transports.

pub(crate) mod engine;
pub mod packet;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios"))]
mod socket;
#[cfg(windows)]
mod windows;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PingError;
use crate::probe::{cancellable, PingResult, Probe};
use crate::resolver::Target;
use packet::{EchoRequest, Family, DEFAULT_PAYLOAD_LEN, MAX_PAYLOAD_LEN};

/// How echo requests leave the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Raw socket. Needs root or CAP_NET_RAW.
    Raw,
    /// Unprivileged datagram ICMP socket; the kernel owns the identifier.
    Datagram,
    /// The operating system's echo helper.
    SystemApi,
    Unavailable,
}

impl Transport {
    pub fn detect(privileged: bool) -> Self {
        if cfg!(windows) {
            Transport::SystemApi
        } else if cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios"
        )) {
            if privileged {
                Transport::Raw
            } else {
                Transport::Datagram
            }
        } else {
            Transport::Unavailable
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Raw => "raw",
            Transport::Datagram => "datagram",
            Transport::SystemApi => "system",
            Transport::Unavailable => "unavailable",
        })
    }
}

/// Sends one echo request per round and waits for its reply.
#[derive(Debug)]
pub struct IcmpProbe {
    target: Target,
    timeout: Duration,
    transport: Transport,
    ttl: Option<u8>,
    size: usize,
    ident: u16,
}

impl IcmpProbe {
    pub fn new(target: Target, timeout: Duration, privileged: bool) -> Self {
        let transport = Transport::detect(privileged);
        info!("icmp transport: {}", transport);
        Self {
            target,
            timeout,
            transport,
            ttl: None,
            size: DEFAULT_PAYLOAD_LEN,
            ident: (std::process::id() & 0xffff) as u16,
        }
    }

    /// TTL / hop limit for outgoing requests.
    pub fn with_ttl(mut self, ttl: Option<u8>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Payload size in bytes. Never below the tracker length nor above
    /// what fits one IPv4 datagram.
    pub fn with_size(mut self, size: Option<usize>) -> Self {
        if let Some(size) = size {
            self.size = size.min(MAX_PAYLOAD_LEN);
        }
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    async fn round(&self, dest: IpAddr, request: EchoRequest) -> PingResult {
        match self.transport {
            Transport::Raw => self.socket_round(dest, request, true).await,
            Transport::Datagram => self.socket_round(dest, request, false).await,
            Transport::SystemApi => self.helper_round(dest, request).await,
            Transport::Unavailable => Err(PingError::Unsupported(
                "icmp is not supported on this platform",
            )),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios"))]
    async fn socket_round(&self, dest: IpAddr, request: EchoRequest, raw: bool) -> PingResult {
        let mut socket = socket::IcmpSocket::open(request.family, raw, self.ttl)
            .map_err(|e| open_error(e, raw))?;
        engine::exchange(&mut socket, dest, &request, raw, self.timeout).await
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios")))]
    async fn socket_round(&self, _dest: IpAddr, _request: EchoRequest, _raw: bool) -> PingResult {
        Err(PingError::Unsupported("icmp sockets are not supported on this platform"))
    }

    #[cfg(windows)]
    async fn helper_round(&self, dest: IpAddr, request: EchoRequest) -> PingResult {
        windows::echo(dest, request, self.ttl, self.timeout).await
    }

    #[cfg(not(windows))]
    async fn helper_round(&self, _dest: IpAddr, _request: EchoRequest) -> PingResult {
        Err(PingError::Unsupported("the icmp helper is only available on windows"))
    }
}

#[cfg_attr(
    not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios")),
    allow(dead_code)
)]
fn open_error(err: std::io::Error, raw: bool) -> PingError {
    let hint = if err.kind() != std::io::ErrorKind::PermissionDenied {
        None
    } else if raw {
        Some("raw sockets need root or CAP_NET_RAW")
    } else {
        Some("check net.ipv4.ping_group_range or use --privileged")
    };
    match hint {
        Some(hint) => PingError::Transport(format!("open icmp socket: {} ({})", err, hint)),
        None => PingError::Transport(format!("open icmp socket: {}", err)),
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    async fn ping_context(&mut self, cancel: &CancellationToken) -> PingResult {
        let ip = cancellable(cancel, self.target.address()).await?;
        let request = EchoRequest::new(Family::of(&ip), self.ident, 0, self.size);
        debug!("echo to {} over {} transport", ip, self.transport);
        cancellable(cancel, self.round(ip, request)).await
    }
}
