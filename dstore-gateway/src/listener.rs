//! Listener lifecycle for the plaintext and TLS ports
//!
//! Both listeners are accept loops running as tokio tasks. Stopping a
//! listener signals its loop and awaits the task, so the socket is closed
//! by the time `stop_plaintext` returns. Connections already accepted keep
//! running on their own tasks.
//!
//! The TLS listener is bound to the primary domain's bundle; other complete
//! bundles in the store are offered by SNI. A restart validates the new
//! credentials before closing the active listener, so a missing artifact
//! never takes TLS down. Failed rebinds of either listener are retried after
//! a short delay; stopping the plaintext listener cancels its pending retry.

use crate::defaults::{TLS_RETRY_DELAY, TLS_RETRY_LIMIT};
use crate::service::GatewayBody;
use crate::tls::{
    BundleError, CertStore, JobBegin, ProvisionJobs, Provisioner, SniCertResolver,
    TlsConfigError,
};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::Mutex as SyncMutex;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("No complete certificate bundle for {0}")]
    MissingBundle(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("Certificate store error: {0}")]
    Store(#[from] BundleError),

    #[error("Listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Serves requests accepted by either listener.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>, https: bool) -> Response<GatewayBody>;
}

/// Listener transitions the gatekeeper drives during provisioning.
#[async_trait]
pub trait ListenerControl: Send + Sync {
    /// Returns once the plaintext socket is closed.
    async fn stop_plaintext(&self);
    async fn start_plaintext(&self) -> Result<(), ListenerError>;
    async fn restart_tls(&self) -> Result<(), ListenerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextState {
    Stopped,
    Running { addr: SocketAddr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsState {
    Absent,
    Active { domain: String, addr: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub primary_domain: String,
}

struct RunningListener {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningListener {
    async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        let (shutdown, rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, tls, handler, rx));

        Ok(Self {
            addr: local,
            shutdown,
            task,
        })
    }

    async fn close(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            tracing::error!(addr = %self.addr, "Listener task panicked");
        }
    }
}

#[derive(Default)]
struct PlaintextSlot {
    running: Option<RunningListener>,
    /// Rebind scheduled after a failed bind
    retry: Option<JoinHandle<()>>,
}

struct ActiveTls {
    domain: String,
    listener: RunningListener,
}

pub struct ListenerManager {
    config: ListenerConfig,
    store: Arc<CertStore>,
    provisioner: Arc<dyn Provisioner>,
    jobs: Arc<ProvisionJobs>,
    handler: Arc<dyn RequestHandler>,
    plaintext: Mutex<PlaintextSlot>,
    tls: Mutex<Option<ActiveTls>>,
    tls_retry: SyncMutex<Option<JoinHandle<()>>>,
    this: Weak<ListenerManager>,
}

impl ListenerManager {
    /// Build the manager together with the request handler it serves.
    ///
    /// `make_handler` receives a weak control handle back to the manager so
    /// the handler can drive listener transitions without keeping it alive.
    pub fn new<F>(
        config: ListenerConfig,
        store: Arc<CertStore>,
        provisioner: Arc<dyn Provisioner>,
        jobs: Arc<ProvisionJobs>,
        make_handler: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<dyn ListenerControl>) -> Arc<dyn RequestHandler>,
    {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let control: Weak<dyn ListenerControl> = this.clone();
            Self {
                config,
                store,
                provisioner,
                jobs,
                handler: make_handler(control),
                plaintext: Mutex::new(PlaintextSlot::default()),
                tls: Mutex::new(None),
                tls_retry: SyncMutex::new(None),
                this: this.clone(),
            }
        })
    }

    pub async fn plaintext_state(&self) -> PlaintextState {
        match self.plaintext.lock().await.running.as_ref() {
            Some(running) => PlaintextState::Running { addr: running.addr },
            None => PlaintextState::Stopped,
        }
    }

    pub async fn tls_state(&self) -> TlsState {
        match self.tls.lock().await.as_ref() {
            Some(active) => TlsState::Active {
                domain: active.domain.clone(),
                addr: active.listener.addr,
            },
            None => TlsState::Absent,
        }
    }

    /// Bind the plaintext listener. A failed bind is retried in the
    /// background until it succeeds or the listener is stopped.
    pub async fn start_plaintext(&self) -> Result<(), ListenerError> {
        let mut slot = self.plaintext.lock().await;
        self.start_plaintext_locked(&mut slot, 0).await
    }

    async fn start_plaintext_locked(
        &self,
        slot: &mut PlaintextSlot,
        attempt: u32,
    ) -> Result<(), ListenerError> {
        if let Some(pending) = slot.retry.take() {
            pending.abort();
        }
        if let Some(running) = slot.running.as_ref() {
            tracing::debug!(addr = %running.addr, "HTTP listener already running");
            return Ok(());
        }

        match RunningListener::bind(self.config.http_addr, None, self.handler.clone()).await {
            Ok(running) => {
                tracing::info!(addr = %running.addr, "HTTP listener started");
                slot.running = Some(running);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(attempt = attempt + 1, error = %e, "HTTP listener not bound, retrying");
                slot.retry = self.schedule_plaintext_retry(attempt + 1);
                Err(e)
            }
        }
    }

    fn schedule_plaintext_retry(&self, attempt: u32) -> Option<JoinHandle<()>> {
        let this = self.this.upgrade()?;
        Some(tokio::spawn(async move {
            tokio::time::sleep(TLS_RETRY_DELAY).await;
            let mut slot = this.plaintext.lock().await;
            // Our own handle; dropping it does not cancel this task
            slot.retry.take();
            let _ = this.start_plaintext_locked(&mut slot, attempt).await;
        }))
    }

    pub async fn stop_plaintext(&self) {
        let mut slot = self.plaintext.lock().await;
        if let Some(pending) = slot.retry.take() {
            pending.abort();
        }
        let Some(running) = slot.running.take() else {
            return;
        };
        let addr = running.addr;
        running.close().await;
        tracing::info!(addr = %addr, "HTTP listener stopped");
    }

    /// Close any active TLS listener and rebind it with freshly loaded
    /// credentials. Retries later when the primary bundle is missing or the
    /// port cannot be bound.
    pub async fn restart_tls(&self) -> Result<(), ListenerError> {
        self.restart_tls_attempt(0).await
    }

    async fn restart_tls_attempt(&self, attempt: u32) -> Result<(), ListenerError> {
        let result = self.rebind_tls().await;
        match &result {
            Ok(()) => {
                let pending = self.tls_retry.lock().take();
                if let Some(pending) = pending {
                    pending.abort();
                }
            }
            Err(e @ (ListenerError::MissingBundle(_) | ListenerError::Bind { .. })) => {
                tracing::warn!(attempt = attempt + 1, error = %e, "TLS listener not bound, retrying");
                self.schedule_tls_retry(attempt + 1);
            }
            Err(e) => {
                tracing::error!(error = %e, "TLS listener not bound");
            }
        }
        result
    }

    async fn rebind_tls(&self) -> Result<(), ListenerError> {
        let domain = self.config.primary_domain.clone();
        // Credentials are built before the active listener is touched
        let primary = domain.clone();
        let server_config = self
            .store
            .blocking(move |store| build_server_config(store, &primary))
            .await?;

        let mut slot = self.tls.lock().await;
        let restarted = match slot.take() {
            Some(active) => {
                active.listener.close().await;
                true
            }
            None => false,
        };

        let acceptor = TlsAcceptor::from(server_config);
        let listener = RunningListener::bind(
            self.config.https_addr,
            Some(acceptor),
            self.handler.clone(),
        )
        .await?;

        if restarted {
            tracing::info!(domain = %domain, addr = %listener.addr, "HTTPS listener restarted");
        } else {
            tracing::info!(domain = %domain, addr = %listener.addr, "HTTPS listener started");
        }
        *slot = Some(ActiveTls { domain, listener });
        Ok(())
    }

    fn schedule_tls_retry(&self, attempt: u32) {
        if attempt > TLS_RETRY_LIMIT {
            tracing::error!(attempts = TLS_RETRY_LIMIT, "Giving up on binding the TLS listener");
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let handle = tokio::spawn(async move {
            tokio::time::sleep(TLS_RETRY_DELAY).await;
            this.tls_retry.lock().take();
            let _ = this.restart_tls_attempt(attempt).await;
        });
        if let Some(previous) = self.tls_retry.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Make sure the TLS listener is serving the primary domain.
    ///
    /// No-op when already active. With a complete bundle the listener is
    /// bound directly; otherwise the bundle is provisioned in the background
    /// and activation is attempted again once the command succeeds.
    pub async fn ensure_tls_active(&self) -> Result<(), ListenerError> {
        if self.tls.lock().await.is_some() {
            return Ok(());
        }

        let domain = self.config.primary_domain.clone();
        let primary = domain.clone();
        let complete = self
            .store
            .blocking(move |store| Ok::<_, BundleError>(store.has_complete_bundle(&primary)))
            .await?;
        if complete {
            return self.restart_tls().await;
        }

        match self.jobs.begin(&domain) {
            JobBegin::Started => {}
            JobBegin::InFlight => return Ok(()),
            JobBegin::CoolingDown { remaining } => {
                tracing::info!(domain = %domain, remaining_secs = remaining.as_secs(), "Provisioning cooling down");
                return Ok(());
            }
        }

        let target = domain.clone();
        let cert_dir = match self
            .store
            .blocking(move |store| store.ensure_domain_dir(&target))
            .await
        {
            Ok(dir) => dir,
            Err(e) => {
                self.jobs.mark_failed(&domain);
                return Err(e.into());
            }
        };

        tracing::info!(domain = %domain, "No complete certificate bundle, provisioning");
        self.spawn_primary_provisioning(domain, cert_dir);
        Ok(())
    }

    fn spawn_primary_provisioning(&self, domain: String, cert_dir: PathBuf) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            this.jobs.mark_running(&domain);
            match this.provisioner.provision(&domain, cert_dir).await {
                Ok(()) => {
                    this.jobs.mark_succeeded(&domain);
                    tracing::info!(domain = %domain, "Certificates obtained");
                    tokio::time::sleep(TLS_RETRY_DELAY).await;
                    if let Err(e) = this.ensure_tls_active().await {
                        tracing::error!(domain = %domain, error = %e, "Failed to activate TLS");
                    }
                }
                Err(e) => {
                    this.jobs.mark_failed(&domain);
                    tracing::error!(domain = %domain, error = %e, "Failed to obtain certificates");
                }
            }
        });
    }

    /// Stop both listeners and cancel any pending TLS retry.
    pub async fn shutdown(&self) {
        let pending = self.tls_retry.lock().take();
        if let Some(pending) = pending {
            pending.abort();
        }
        self.stop_plaintext().await;
        if let Some(active) = self.tls.lock().await.take() {
            active.listener.close().await;
            tracing::info!(domain = %active.domain, "HTTPS listener stopped");
        }
    }
}

#[async_trait]
impl ListenerControl for ListenerManager {
    async fn stop_plaintext(&self) {
        ListenerManager::stop_plaintext(self).await
    }

    async fn start_plaintext(&self) -> Result<(), ListenerError> {
        ListenerManager::start_plaintext(self).await
    }

    async fn restart_tls(&self) -> Result<(), ListenerError> {
        ListenerManager::restart_tls(self).await
    }
}

/// rustls config for the primary bundle plus every other complete bundle.
/// Reads from disk; run it on the blocking pool.
fn build_server_config(
    store: &CertStore,
    primary: &str,
) -> Result<Arc<ServerConfig>, ListenerError> {
    let bundle = match store.load_bundle(primary) {
        Ok(bundle) => bundle,
        Err(BundleError::NotFound(_) | BundleError::Incomplete { .. }) => {
            return Err(ListenerError::MissingBundle(primary.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(days) = bundle.days_until_expiry() {
        tracing::info!(domain = %primary, days_until_expiry = days, "Loaded certificate bundle");
    }

    let mut resolver = SniCertResolver::new(&bundle)?;
    for domain in store.complete_domains()? {
        if domain == primary {
            continue;
        }
        let added = store
            .load_bundle(&domain)
            .map_err(ListenerError::from)
            .and_then(|extra| resolver.add_bundle(&extra).map_err(ListenerError::from));
        if let Err(e) = added {
            tracing::warn!(domain = %domain, error = %e, "Skipping certificate bundle");
        }
    }

    Ok(resolver.into_server_config()?)
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let handler = handler.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, handler, true).await,
                    Err(e) => tracing::debug!(peer = %peer, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(stream, handler, false).await,
            }
        });
    }
}

async fn serve_connection<I>(io: I, handler: Arc<dyn RequestHandler>, https: bool)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req, https).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
        tracing::debug!(error = %e, "Connection closed with error");
    }
}
