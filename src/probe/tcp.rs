use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{bounded, cancellable, Detail, PingResult, Probe, Reply};
use crate::error::PingError;
use crate::resolver::Target;

/// Times a TCP three-way handshake.
#[derive(Debug)]
pub struct TcpProbe {
    target: Target,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: Target, port: u16, timeout: Duration) -> Self {
        Self {
            target,
            port,
            timeout,
        }
    }
}

/// Connect to `addr` within `timeout`, mapping failures onto the taxonomy.
pub(crate) async fn connect(
    cancel: &CancellationToken,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, PingError> {
    bounded(cancel, timeout, async {
        TcpStream::connect(addr)
            .await
            .map_err(|source| PingError::Connect { addr, source })
    })
    .await
}

#[async_trait]
impl Probe for TcpProbe {
    async fn ping_context(&mut self, cancel: &CancellationToken) -> PingResult {
        let ip = cancellable(cancel, self.target.address()).await?;
        let addr = SocketAddr::new(ip, self.port);

        let started = Instant::now();
        let stream = connect(cancel, addr, self.timeout).await?;
        let elapsed = started.elapsed();
        drop(stream);

        debug!("tcp connect to {} took {:?}", addr, elapsed);
        Ok(Reply::new(ip, elapsed, Detail::Tcp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::CountingResolver;
    use std::sync::atomic::Ordering;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listener_and_reuses_lookup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let resolver = CountingResolver::new("127.0.0.1");
        let target = Target::new("loopback.test", resolver.clone());
        let mut probe = TcpProbe::new(target, port, Duration::from_secs(1));

        for _ in 0..3 {
            let reply = probe.ping().await.unwrap();
            assert_eq!(reply.peer, resolver.ip);
            assert_eq!(reply.detail, Detail::Tcp);
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_round_returns_cancelled() {
        let resolver = CountingResolver::new("127.0.0.1");
        let mut probe = TcpProbe::new(Target::new("x.test", resolver), 9, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(probe.ping_context(&cancel).await, Err(PingError::Cancelled)));
    }
}
