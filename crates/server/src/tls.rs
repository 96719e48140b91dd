//! TLS material: SNI-driven certificate selection against the domain map.

use crate::domains::DomainMap;
use pagoda_core::host;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;

/// Parse a PEM certificate chain and private key into a signing-ready key
/// pair.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in PEM");
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem))?
            .ok_or_else(|| anyhow::anyhow!("no private key in PEM"))?;

    let signing_key = aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported private key: {e}"))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Certificate resolver consulting the domain map per handshake.
///
/// The tenant's key pair is assembled lazily and memoized on the domain
/// descriptor (never under the map lock). Unknown hosts and hosts without
/// their own certificate fall back to the default certificate.
pub struct SniResolver {
    domains: Arc<DomainMap>,
    default_cert: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new(domains: Arc<DomainMap>, default_cert: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            domains,
            default_cert,
        }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            let normalized = host::normalize(name);
            if let Some(domain) = self.domains.get(&normalized) {
                if let Some(certified) = domain.certificate() {
                    return Some(certified);
                }
            }
        }
        self.default_cert.clone()
    }
}

/// Build the rustls server config for the HTTPS listeners.
pub fn server_config(resolver: Arc<SniResolver>) -> rustls::ServerConfig {
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("default protocol versions")
    .with_no_client_auth()
    .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}
