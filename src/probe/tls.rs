use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, ProtocolVersion, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::tcp::connect;
use super::{bounded, cancellable, Detail, PingResult, Probe, Reply};
use crate::error::PingError;
use crate::resolver::Target;

/// TLS version a probe is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "13" | "1.3" => Ok(TlsVersion::Tls13),
            "12" | "1.2" => Ok(TlsVersion::Tls12),
            "11" | "1.1" | "10" | "1.0" => Err(format!("TLS version {} is not supported", s)),
            _ => Err(format!("unknown TLS version {:?}, expected 13 or 12", s)),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => f.write_str("TLS 1.2"),
            TlsVersion::Tls13 => f.write_str("TLS 1.3"),
        }
    }
}

pub(crate) fn version_name(version: Option<ProtocolVersion>) -> String {
    match version {
        Some(ProtocolVersion::TLSv1_3) => "TLS 1.3".to_string(),
        Some(ProtocolVersion::TLSv1_2) => "TLS 1.2".to_string(),
        Some(other) => format!("{:?}", other),
        None => "unknown".to_string(),
    }
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Client configuration shared by the TLS, DNS-over-TLS and QUIC probes.
pub(crate) fn client_config(
    version: Option<TlsVersion>,
    insecure: bool,
    alpn: &[&str],
) -> Result<Arc<ClientConfig>, PingError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions = match version {
        None => rustls::ALL_VERSIONS,
        Some(TlsVersion::Tls12) => TLS12_ONLY,
        Some(TlsVersion::Tls13) => TLS13_ONLY,
    };
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(PingError::handshake)?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, PingError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(PingError::handshake)
}

/// Certificate verifier for `--insecure`: accepts any chain but still checks
/// handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Times TCP connection setup and the TLS handshake separately.
#[derive(Debug)]
pub struct TlsProbe {
    target: Target,
    port: u16,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    config: Arc<ClientConfig>,
}

impl TlsProbe {
    pub fn new(
        target: Target,
        port: u16,
        connect_timeout: Duration,
        handshake_timeout: Duration,
        version: Option<TlsVersion>,
        insecure: bool,
    ) -> Result<Self, PingError> {
        let config = client_config(version, insecure, &[])?;
        Ok(Self {
            target,
            port,
            connect_timeout,
            handshake_timeout,
            config,
        })
    }
}

#[async_trait]
impl Probe for TlsProbe {
    async fn ping_context(&mut self, cancel: &CancellationToken) -> PingResult {
        let ip = cancellable(cancel, self.target.address()).await?;
        let addr = SocketAddr::new(ip, self.port);
        let name = server_name(self.target.host())?;

        let t0 = Instant::now();
        let stream = connect(cancel, addr, self.connect_timeout).await?;
        let t1 = Instant::now();

        let mut tls = bounded(cancel, self.handshake_timeout, async {
            TlsConnector::from(self.config.clone())
                .connect(name, stream)
                .await
                .map_err(PingError::handshake)
        })
        .await?;
        let t2 = Instant::now();

        let version = version_name(tls.get_ref().1.protocol_version());
        // Best effort close_notify; the socket is closed on drop either way.
        let _ = tokio::time::timeout(Duration::from_millis(100), tls.shutdown()).await;
        debug!("tls handshake with {} negotiated {}", addr, version);

        let connection = t1 - t0;
        let handshake = t2 - t1;
        Ok(Reply::new(
            ip,
            connection + handshake,
            Detail::Tls {
                connection,
                handshake,
                version,
            },
        ))
    }
}
