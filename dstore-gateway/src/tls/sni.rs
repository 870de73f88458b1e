//! SNI-based certificate selection for the TLS listener
//!
//! The primary domain's bundle is always installed and answers handshakes
//! without SNI or for names with no bundle of their own.

use super::store::CertBundle;
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid PEM in bundle for {domain}: {source}")]
    Pem {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificate found in bundle for {0}")]
    MissingCertificate(String),

    #[error("No private key found in bundle for {0}")]
    MissingKey(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Parse a bundle into a signing key plus the certificate chain presented to clients.
pub fn certified_key(bundle: &CertBundle) -> Result<Arc<CertifiedKey>, TlsConfigError> {
    let pem_err = |source| TlsConfigError::Pem {
        domain: bundle.domain.clone(),
        source,
    };

    let full_chain = bundle.full_chain_pem();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &full_chain[..])
        .collect::<Result<_, _>>()
        .map_err(pem_err)?;
    if certs.is_empty() {
        return Err(TlsConfigError::MissingCertificate(bundle.domain.clone()));
    }

    let key = rustls_pemfile::private_key(&mut &bundle.private_key[..])
        .map_err(pem_err)?
        .ok_or_else(|| TlsConfigError::MissingKey(bundle.domain.clone()))?;

    let signing_key = crypto_provider().key_provider.load_private_key(key)?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Resolves the certificate for a handshake by SNI hostname
#[derive(Debug)]
pub struct SniCertResolver {
    primary_domain: String,
    primary: Arc<CertifiedKey>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl SniCertResolver {
    pub fn new(primary: &CertBundle) -> Result<Self, TlsConfigError> {
        Ok(Self {
            primary_domain: primary.domain.clone(),
            primary: certified_key(primary)?,
            by_name: HashMap::new(),
        })
    }

    pub fn add_bundle(&mut self, bundle: &CertBundle) -> Result<(), TlsConfigError> {
        let key = certified_key(bundle)?;
        self.by_name.insert(bundle.domain.to_ascii_lowercase(), key);
        Ok(())
    }

    pub fn primary_domain(&self) -> &str {
        &self.primary_domain
    }

    pub fn has_cert(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        hostname == self.primary_domain || self.by_name.contains_key(&hostname)
    }

    /// Certificate for a hostname, falling back to the primary bundle.
    pub fn lookup(&self, hostname: Option<&str>) -> Arc<CertifiedKey> {
        hostname
            .and_then(|name| self.by_name.get(&name.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_else(|| self.primary.clone())
    }

    /// Wrap the resolver in a rustls server config advertising h2 and http/1.1.
    pub fn into_server_config(self) -> Result<Arc<ServerConfig>, TlsConfigError> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(self));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name();
        tracing::trace!(hostname = ?name, "SNI certificate lookup");
        Some(self.lookup(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::testing::self_signed_bundle;

    #[test]
    fn test_certified_key_from_generated_bundle() {
        let bundle = self_signed_bundle("example.com");
        let key = certified_key(&bundle).unwrap();
        // leaf + chain
        assert_eq!(key.cert.len(), 2);
    }

    #[test]
    fn test_invalid_bundle_is_rejected() {
        let bundle = CertBundle {
            domain: "example.com".to_string(),
            private_key: b"not a key".to_vec(),
            certificate: b"not a certificate".to_vec(),
            chain: Vec::new(),
        };
        assert!(matches!(
            certified_key(&bundle),
            Err(TlsConfigError::MissingCertificate(_))
        ));

        let mut keyless = self_signed_bundle("example.com");
        keyless.private_key = Vec::new();
        assert!(matches!(
            certified_key(&keyless),
            Err(TlsConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn test_lookup_prefers_exact_name_and_falls_back_to_primary() {
        let primary = self_signed_bundle("example.com");
        let store = self_signed_bundle("store.example.com");

        let mut resolver = SniCertResolver::new(&primary).unwrap();
        resolver.add_bundle(&store).unwrap();

        assert!(resolver.has_cert("example.com"));
        assert!(resolver.has_cert("STORE.example.com"));
        assert!(!resolver.has_cert("apps.example.com"));

        let store_key = certified_key(&store).unwrap();
        assert_eq!(
            resolver.lookup(Some("store.example.com")).cert[0],
            store_key.cert[0]
        );

        let primary_key = certified_key(&primary).unwrap();
        assert_eq!(
            resolver.lookup(Some("apps.example.com")).cert[0],
            primary_key.cert[0]
        );
        assert_eq!(resolver.lookup(None).cert[0], primary_key.cert[0]);
    }

    #[test]
    fn test_server_config_advertises_h2_and_http11() {
        let resolver = SniCertResolver::new(&self_signed_bundle("example.com")).unwrap();
        assert_eq!(resolver.primary_domain(), "example.com");

        let config = resolver.into_server_config().unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
