//! On-demand certificate provisioning for recognized hostnames
//!
//! Every request's host is checked here. A host that carries one of the
//! recognized subdomain prefixes, is not on the allow-list and has no complete
//! bundle gets a certificate provisioned in the background:
//!
//! 1. take the gateway-wide "plaintext paused" permit
//! 2. stop the plaintext listener (the command answers the HTTP challenge)
//! 3. create the domain's certificate directory and run the command
//! 4. wait the settle delay, then restart the plaintext listener
//! 5. on success record the domain and rebind the TLS listener
//!
//! The request that triggered provisioning is served normally.

use crate::defaults::{PROVISION_SETTLE_DELAY, PROVISIONED_HOST_PREFIXES};
use crate::listener::ListenerControl;
use crate::tls::{BundleError, CertStore, JobBegin, ProvisionError, ProvisionJobs, Provisioner};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error(transparent)]
    Store(#[from] BundleError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Provisioning for {0} finished without a complete bundle")]
    IncompleteBundle(String),
}

#[derive(Clone)]
pub struct Gatekeeper {
    store: Arc<CertStore>,
    provisioner: Arc<dyn Provisioner>,
    jobs: Arc<ProvisionJobs>,
    listeners: Weak<dyn ListenerControl>,
    /// Held from plaintext stop to plaintext restart
    plaintext_paused: Arc<Mutex<()>>,
}

impl Gatekeeper {
    pub fn new(
        store: Arc<CertStore>,
        provisioner: Arc<dyn Provisioner>,
        jobs: Arc<ProvisionJobs>,
        listeners: Weak<dyn ListenerControl>,
    ) -> Self {
        Self {
            store,
            provisioner,
            jobs,
            listeners,
            plaintext_paused: Arc::new(Mutex::new(())),
        }
    }

    /// Hostname to provision for `host`, if any.
    pub async fn needs_provisioning(&self, host: &str) -> Option<String> {
        let hostname = strip_port(host).to_ascii_lowercase();
        if !has_provisioned_prefix(&hostname) {
            return None;
        }

        let domain = match crate::tls::normalize_domain(&hostname) {
            Ok(domain) => domain,
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "Ignoring unusable host");
                return None;
            }
        };

        let candidate = domain.clone();
        let settled = self
            .store
            .blocking(move |store| {
                Ok::<_, BundleError>(
                    store.is_domain_known(&candidate) || store.has_complete_bundle(&candidate),
                )
            })
            .await;
        match settled {
            Ok(false) => Some(domain),
            Ok(true) => None,
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "Certificate store check failed");
                None
            }
        }
    }

    /// Check a request's host and start provisioning when it qualifies.
    ///
    /// Returns the background task when one was started.
    pub async fn observe(&self, host: &str) -> Option<JoinHandle<()>> {
        let domain = self.needs_provisioning(host).await?;

        match self.jobs.begin(&domain) {
            JobBegin::Started => {}
            JobBegin::InFlight => return None,
            JobBegin::CoolingDown { remaining } => {
                tracing::debug!(domain = %domain, remaining_secs = remaining.as_secs(), "Provisioning cooling down");
                return None;
            }
        }

        tracing::info!(domain = %domain, "Unprovisioned host, obtaining certificate");
        let this = self.clone();
        Some(tokio::spawn(async move { this.provision(domain).await }))
    }

    async fn provision(&self, domain: String) {
        let Some(listeners) = self.listeners.upgrade() else {
            self.jobs.mark_failed(&domain);
            return;
        };

        let paused = self.plaintext_paused.lock().await;
        listeners.stop_plaintext().await;

        let result = self.run_provisioning(&domain).await;

        tokio::time::sleep(PROVISION_SETTLE_DELAY).await;
        if let Err(e) = listeners.start_plaintext().await {
            tracing::error!(error = %e, "Failed to restart HTTP listener");
        }
        drop(paused);

        match result {
            Ok(()) => {
                self.jobs.mark_succeeded(&domain);
                let known = domain.clone();
                let recorded = self
                    .store
                    .blocking(move |store| store.mark_domain_known(&known))
                    .await;
                if let Err(e) = recorded {
                    tracing::warn!(domain = %domain, error = %e, "Failed to record domain");
                }
                tracing::info!(domain = %domain, "Certificates updated");
                if let Err(e) = listeners.restart_tls().await {
                    tracing::error!(domain = %domain, error = %e, "Failed to restart HTTPS listener");
                }
            }
            Err(e) => {
                self.jobs.mark_failed(&domain);
                tracing::error!(domain = %domain, error = %e, "Error updating certificates");
            }
        }
    }

    async fn run_provisioning(&self, domain: &str) -> Result<(), GatekeeperError> {
        let target = domain.to_string();
        let cert_dir = self
            .store
            .blocking(move |store| store.ensure_domain_dir(&target))
            .await?;
        self.jobs.mark_running(domain);
        self.provisioner.provision(domain, cert_dir).await?;

        let target = domain.to_string();
        let complete = self
            .store
            .blocking(move |store| Ok::<_, BundleError>(store.has_complete_bundle(&target)))
            .await?;
        if !complete {
            return Err(GatekeeperError::IncompleteBundle(domain.to_string()));
        }
        Ok(())
    }
}

fn has_provisioned_prefix(hostname: &str) -> bool {
    PROVISIONED_HOST_PREFIXES
        .iter()
        .any(|prefix| hostname.starts_with(prefix))
}

/// Drop a trailing `:port` from a Host value, leaving IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map(|end| &host[..=end]).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
