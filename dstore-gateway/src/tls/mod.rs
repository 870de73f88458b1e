//! TLS/Certificate management
//!
//! Handles:
//! - Per-domain certificate bundles on disk and the known-domain list
//! - Running the external provisioning command
//! - Tracking in-flight provisioning jobs
//! - Building the rustls server config with SNI selection

mod jobs;
mod provision;
mod sni;
mod store;

pub use jobs::{JobBegin, ProvisionJobs};
pub use provision::{CommandProvisioner, ProvisionError, Provisioner};
pub use sni::{SniCertResolver, TlsConfigError};
pub use store::{BundleError, CertStore, normalize_domain};

#[cfg(test)]
pub use jobs::JobStatus;
#[cfg(test)]
pub use store::{CERT_FILE, CHAIN_FILE, CertBundle, KEY_FILE};

pub fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}


#[cfg(test)]
mod tests {
    use super::install_rustls_crypto_provider;

    #[test]
    fn install_rustls_crypto_provider_is_idempotent() {
        install_rustls_crypto_provider();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());

        install_rustls_crypto_provider();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }
}
