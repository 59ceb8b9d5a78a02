use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quinn::crypto::rustls::{HandshakeData, QuicClientConfig};
use quinn::{ClientConfig, Endpoint, IdleTimeout, TransportConfig, VarInt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::tls::{client_config, TlsVersion};
use super::{bounded, cancellable, Detail, PingResult, Probe, Reply};
use crate::error::PingError;
use crate::resolver::Target;

pub const ALPN_H3: &str = "h3";

/// HTTP/3 `H3_NO_ERROR`.
const H3_NO_ERROR: u32 = 0x100;

/// Times a QUIC handshake.
#[derive(Debug)]
pub struct QuicProbe {
    target: Target,
    port: u16,
    timeout: Duration,
    alpn: String,
    client: ClientConfig,
}

impl QuicProbe {
    pub fn new(
        target: Target,
        port: u16,
        timeout: Duration,
        alpn: Option<&str>,
        insecure: bool,
    ) -> Result<Self, PingError> {
        let alpn = alpn.filter(|a| !a.is_empty()).unwrap_or(ALPN_H3).to_string();
        let tls = client_config(Some(TlsVersion::Tls13), insecure, &[alpn.as_str()])?;
        let crypto = QuicClientConfig::try_from(tls).map_err(PingError::handshake)?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(IdleTimeout::try_from(timeout).ok());
        let mut client = ClientConfig::new(Arc::new(crypto));
        client.transport_config(Arc::new(transport));

        Ok(Self {
            target,
            port,
            timeout,
            alpn,
            client,
        })
    }

    fn close_code(&self) -> VarInt {
        if self.alpn == ALPN_H3 {
            VarInt::from_u32(H3_NO_ERROR)
        } else {
            VarInt::from_u32(0)
        }
    }
}

#[async_trait]
impl Probe for QuicProbe {
    async fn ping_context(&mut self, cancel: &CancellationToken) -> PingResult {
        let ip = cancellable(cancel, self.target.address()).await?;
        let addr = SocketAddr::new(ip, self.port);
        let local: IpAddr = match ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let endpoint = Endpoint::client(SocketAddr::new(local, 0))?;
        let host = self.target.host().trim_start_matches('[').trim_end_matches(']');

        let started = Instant::now();
        let result = bounded(cancel, self.timeout, async {
            let connecting = endpoint
                .connect_with(self.client.clone(), addr, host)
                .map_err(PingError::handshake)?;
            connecting.await.map_err(|e| match e {
                quinn::ConnectionError::TimedOut => PingError::Timeout,
                other => PingError::handshake(other),
            })
        })
        .await;
        let elapsed = started.elapsed();

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                endpoint.close(VarInt::from_u32(0), b"");
                return Err(e);
            }
        };

        let alpn = connection
            .handshake_data()
            .and_then(|data| data.downcast::<HandshakeData>().ok())
            .and_then(|data| data.protocol)
            .map(|p| String::from_utf8_lossy(&p).into_owned());
        connection.close(self.close_code(), b"");
        endpoint.close(self.close_code(), b"");
        debug!("quic handshake with {} took {:?}", addr, elapsed);

        Ok(Reply::new(
            ip,
            elapsed,
            Detail::Quic {
                alpn,
                tls: TlsVersion::Tls13.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::CountingResolver;

    #[test]
    fn default_alpn_closes_with_h3_code() {
        let target = Target::new("example.com", CountingResolver::new("192.0.2.1"));
        let probe = QuicProbe::new(target, 443, Duration::from_secs(1), None, false).unwrap();
        assert_eq!(probe.alpn, "h3");
        assert_eq!(probe.close_code(), VarInt::from_u32(0x100));

        let target = Target::new("example.com", CountingResolver::new("192.0.2.1"));
        let probe = QuicProbe::new(target, 443, Duration::from_secs(1), Some("doq"), true).unwrap();
        assert_eq!(probe.close_code(), VarInt::from_u32(0));
    }

    #[tokio::test]
    async fn unanswered_handshake_times_out() {
        // Nothing answers QUIC on a freshly bound, idle UDP socket.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let target = Target::new("localhost", CountingResolver::new("127.0.0.1"));
        let mut probe = QuicProbe::new(target, port, Duration::from_millis(300), None, true).unwrap();

        let err = probe.ping().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }
}
