use std::sync::Arc;

use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::ServerConfig;

/// Server config with a fresh self-signed certificate for `localhost`,
/// offering TLS 1.2 and 1.3 and the given ALPN protocols.
pub fn self_signed(alpn: &[&[u8]]) -> ServerConfig {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key.into())
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config
}
