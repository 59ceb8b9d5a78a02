use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::PingError;

/// Which address family a lookup may return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddressFamily {
    /// Both or neither flag means either family.
    pub fn from_flags(ipv4: bool, ipv6: bool) -> Self {
        match (ipv4, ipv6) {
            (true, false) => AddressFamily::V4,
            (false, true) => AddressFamily::V6,
            _ => AddressFamily::Any,
        }
    }

    pub fn accepts(self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => ip.is_ipv4(),
            AddressFamily::V6 => ip.is_ipv6(),
        }
    }
}

/// Hostname to address lookup.
#[async_trait]
pub trait Resolve: Send + Sync + fmt::Debug {
    async fn lookup(&self, host: &str) -> Result<IpAddr, PingError>;
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver {
    family: AddressFamily,
}

impl SystemResolver {
    pub fn new(family: AddressFamily) -> Self {
        Self { family }
    }

    pub fn shared(family: AddressFamily) -> Arc<dyn Resolve> {
        Arc::new(Self::new(family))
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<IpAddr, PingError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| PingError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        // First address of the requested family, in resolver order.
        addrs
            .map(|addr| addr.ip())
            .find(|ip| self.family.accepts(ip))
            .ok_or_else(|| PingError::Resolve {
                host: host.to_string(),
                reason: "no address of the requested family".to_string(),
            })
    }
}

/// The host a probe talks to, with its pinned address and lookup cache.
#[derive(Debug, Clone)]
pub struct Target {
    host: String,
    pinned: Option<IpAddr>,
    cached: Option<IpAddr>,
    resolver: Arc<dyn Resolve>,
}

impl Target {
    pub fn new(host: impl Into<String>, resolver: Arc<dyn Resolve>) -> Self {
        let host = host.into();
        // A literal address needs no lookup.
        let pinned = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok();
        Self {
            host,
            pinned,
            cached: None,
            resolver,
        }
    }

    /// Use `ip` for every round instead of resolving the host.
    pub fn pin(mut self, ip: Option<IpAddr>) -> Self {
        if ip.is_some() {
            self.pinned = ip;
        }
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// The address to use for this round. Resolves at most once until
    /// [`Target::clear`] is called.
    pub async fn address(&mut self) -> Result<IpAddr, PingError> {
        if let Some(ip) = self.pinned.or(self.cached) {
            return Ok(ip);
        }
        let ip = self.resolver.lookup(&self.host).await?;
        debug!("resolved {} to {}", self.host, ip);
        self.cached = Some(ip);
        Ok(ip)
    }

    /// Forget the cached lookup so the next round resolves again.
    pub fn clear(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolver that answers from a fixed address and counts lookups.
    #[derive(Debug)]
    pub(crate) struct CountingResolver {
        pub ip: IpAddr,
        pub calls: AtomicUsize,
    }

    impl CountingResolver {
        pub(crate) fn new(ip: &str) -> Arc<Self> {
            Arc::new(Self {
                ip: ip.parse().unwrap(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn lookup(&self, _host: &str) -> Result<IpAddr, PingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.ip)
        }
    }

    #[tokio::test]
    async fn lookup_is_cached_until_cleared() {
        let resolver = CountingResolver::new("192.0.2.7");
        let mut target = Target::new("example.test", resolver.clone());

        for _ in 0..3 {
            assert_eq!(target.address().await.unwrap(), resolver.ip);
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        target.clear();
        target.address().await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn literal_and_pinned_addresses_skip_lookup() {
        let resolver = CountingResolver::new("192.0.2.7");
        let mut literal = Target::new("[::1]", resolver.clone());
        assert_eq!(literal.address().await.unwrap(), "::1".parse::<IpAddr>().unwrap());

        let mut pinned =
            Target::new("example.test", resolver.clone()).pin(Some("198.51.100.1".parse().unwrap()));
        assert_eq!(pinned.address().await.unwrap(), "198.51.100.1".parse::<IpAddr>().unwrap());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn system_resolver_honours_family() {
        let v4 = SystemResolver::new(AddressFamily::V4);
        assert!(v4.lookup("127.0.0.1").await.unwrap().is_ipv4());

        let v6 = SystemResolver::new(AddressFamily::V6);
        let err = v6.lookup("127.0.0.1").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resolution);
    }

    #[test]
    fn family_flags() {
        assert_eq!(AddressFamily::from_flags(true, false), AddressFamily::V4);
        assert_eq!(AddressFamily::from_flags(false, true), AddressFamily::V6);
        assert_eq!(AddressFamily::from_flags(true, true), AddressFamily::Any);
        assert_eq!(AddressFamily::from_flags(false, false), AddressFamily::Any);
    }
}
