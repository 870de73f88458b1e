//! Certificate store - per-domain bundles on disk and the known-domain list

use crate::paths::StoragePaths;
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use x509_parser::prelude::*;

pub const KEY_FILE: &str = "privkey.pem";
pub const CERT_FILE: &str = "cert.pem";
pub const CHAIN_FILE: &str = "chain.pem";

const BUNDLE_FILES: [&str; 3] = [KEY_FILE, CERT_FILE, CHAIN_FILE];

/// Errors that can occur while reading or recording certificate bundles
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Certificate bundle not found for domain: {0}")]
    NotFound(String),

    #[error("Incomplete certificate bundle for {domain}: missing {}", missing.join(", "))]
    Incomplete {
        domain: String,
        missing: Vec<&'static str>,
    },

    #[error("Invalid domain name: {0:?}")]
    InvalidDomain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Private key, leaf certificate and issuer chain for one domain.
#[derive(Clone, PartialEq, Eq)]
pub struct CertBundle {
    pub domain: String,
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
    pub chain: Vec<u8>,
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("domain", &self.domain)
            .field("certificate_len", &self.certificate.len())
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl CertBundle {
    /// Leaf certificate followed by the chain, as presented during a handshake.
    pub fn full_chain_pem(&self) -> Vec<u8> {
        let mut pem = self.certificate.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&self.chain);
        pem
    }

    /// `notAfter` of the leaf certificate, if it parses.
    pub fn expires_at(&self) -> Option<SystemTime> {
        for pem in Pem::iter_from_buffer(&self.certificate) {
            let Ok(pem) = pem else {
                return None;
            };
            if pem.label != "CERTIFICATE" {
                continue;
            }
            let (_, cert) = X509Certificate::from_der(&pem.contents).ok()?;
            let timestamp = cert.validity().not_after.timestamp();
            return u64::try_from(timestamp)
                .ok()
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
        }
        None
    }

    pub fn days_until_expiry(&self) -> Option<i64> {
        self.expires_at()
            .map(|exp| match exp.duration_since(SystemTime::now()) {
                Ok(duration) => (duration.as_secs() / 86400) as i64,
                Err(e) => -(e.duration().as_secs() as i64 / 86400),
            })
    }
}

/// Lowercase a hostname and reject anything that is not safe to use as a
/// directory name or a command argument.
pub fn normalize_domain(domain: &str) -> Result<String, BundleError> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && !domain.starts_with('.')
        && !domain.starts_with('-')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Ok(domain)
    } else {
        Err(BundleError::InvalidDomain(domain))
    }
}

/// Filesystem-backed certificate store.
///
/// Only the provisioning command writes bundle files; the store reads them and
/// owns the domain allow-list.
pub struct CertStore {
    paths: StoragePaths,
    /// Serializes read-modify-append of the domain list
    domain_list_lock: Mutex<()>,
}

impl CertStore {
    pub fn new(paths: StoragePaths) -> Self {
        Self {
            paths,
            domain_list_lock: Mutex::new(()),
        }
    }

    /// Run filesystem work against the store on the blocking pool.
    pub async fn blocking<T, E, F>(self: &Arc<Self>, f: F) -> Result<T, E>
    where
        F: FnOnce(&CertStore) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<tokio::task::JoinError> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    pub fn init(&self) -> Result<(), BundleError> {
        std::fs::create_dir_all(self.paths.cert_root())?;
        Ok(())
    }

    pub fn domain_dir(&self, domain: &str) -> Result<PathBuf, BundleError> {
        Ok(self.paths.cert_root().join(normalize_domain(domain)?))
    }

    /// Create the domain's bundle directory so the provisioning command can write into it.
    pub fn ensure_domain_dir(&self, domain: &str) -> Result<PathBuf, BundleError> {
        let dir = self.domain_dir(domain)?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn missing_artifacts(&self, domain: &str) -> Result<Vec<&'static str>, BundleError> {
        let dir = self.domain_dir(domain)?;
        Ok(BUNDLE_FILES
            .into_iter()
            .filter(|name| !dir.join(name).is_file())
            .collect())
    }

    /// True iff key, certificate and chain all exist for the domain.
    pub fn has_complete_bundle(&self, domain: &str) -> bool {
        self.missing_artifacts(domain)
            .map(|missing| missing.is_empty())
            .unwrap_or(false)
    }

    pub fn load_bundle(&self, domain: &str) -> Result<CertBundle, BundleError> {
        let domain = normalize_domain(domain)?;
        let dir = self.paths.cert_root().join(&domain);
        if !dir.is_dir() {
            return Err(BundleError::NotFound(domain));
        }

        let missing = self.missing_artifacts(&domain)?;
        if !missing.is_empty() {
            return Err(BundleError::Incomplete { domain, missing });
        }

        Ok(CertBundle {
            private_key: std::fs::read(dir.join(KEY_FILE))?,
            certificate: std::fs::read(dir.join(CERT_FILE))?,
            chain: std::fs::read(dir.join(CHAIN_FILE))?,
            domain,
        })
    }

    /// Domains under the certificate root that currently hold a complete bundle.
    pub fn complete_domains(&self) -> Result<Vec<String>, BundleError> {
        let root = self.paths.cert_root();
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.has_complete_bundle(&name) {
                domains.push(name);
            }
        }
        domains.sort();
        Ok(domains)
    }

    fn read_domain_list(&self) -> Result<Vec<String>, BundleError> {
        match std::fs::read_to_string(self.paths.domain_list()) {
            Ok(contents) => Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_domain_known(&self, domain: &str) -> bool {
        let Ok(domain) = normalize_domain(domain) else {
            return false;
        };
        match self.read_domain_list() {
            Ok(domains) => domains.iter().any(|d| d.eq_ignore_ascii_case(&domain)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read domain list");
                false
            }
        }
    }

    /// Append the domain to the allow-list unless it is already there.
    ///
    /// Returns whether the list changed.
    pub fn mark_domain_known(&self, domain: &str) -> Result<bool, BundleError> {
        let domain = normalize_domain(domain)?;
        let _guard = self.domain_list_lock.lock();

        let path = self.paths.domain_list();
        let existing = std::fs::read_to_string(&path).or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(String::new())
            } else {
                Err(e)
            }
        })?;
        if existing
            .lines()
            .any(|line| line.trim().eq_ignore_ascii_case(&domain))
        {
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        writeln!(file, "{}", domain)?;
        Ok(true)
    }
}
