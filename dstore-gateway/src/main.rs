// Some helpers are only exercised from tests.
#![allow(dead_code)]

mod assets;
mod config;
mod defaults;
mod gatekeeper;
mod listener;
mod paths;
mod proxy;
mod service;
mod sync;
mod tls;

use crate::assets::Assets;
use crate::config::{Args, GatewayConfig, LogFormat};
use crate::gatekeeper::Gatekeeper;
use crate::listener::{ListenerConfig, ListenerManager, RequestHandler};
use crate::proxy::OriginProxy;
use crate::service::GatewayService;
use crate::sync::ContentSync;
use crate::tls::{CertStore, CommandProvisioner, ProvisionJobs, Provisioner, normalize_domain};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Overall timeout for sync and manifest fetches (not used for proxying)
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tls::install_rustls_crypto_provider();

    let args = Args::parse();
    init_tracing(args.log_format);

    let exe = std::env::current_exe().ok();
    let config = GatewayConfig::from_args(&args, exe.as_deref());

    tracing::info!("dStore Gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Domain: {}", config.domain);
    tracing::info!("HTTP port: {}", config.http_port);
    tracing::info!("HTTPS port: {}", config.https_port);
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Origin: {}", config.origin);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let primary = normalize_domain(&config.domain)?;
    let paths = config.storage();
    std::fs::create_dir_all(paths.root())?;

    let store = Arc::new(CertStore::new(paths.clone()));
    store.init()?;

    let provisioner: Arc<dyn Provisioner> =
        Arc::new(CommandProvisioner::new(config.provision_command.as_str()));
    let jobs = Arc::new(ProvisionJobs::new(config.provision_cooldown));

    let http_client = reqwest::Client::builder()
        .connect_timeout(defaults::UPSTREAM_CONNECT_TIMEOUT)
        .timeout(FETCH_TIMEOUT)
        .build()?;
    let sync = Arc::new(ContentSync::new(
        http_client.clone(),
        &config.origin,
        paths.entry_page(),
    ));
    let assets = Assets::new(
        paths.clone(),
        &config.origin,
        &config.pwa_fallback_url,
        http_client,
    );
    let proxy = OriginProxy::new(&config.origin)?;

    // Startup order: entry page, apps manifest, plaintext, then TLS
    sync.run_once().await;
    assets.ensure_apps_manifest()?;

    let listener_config = ListenerConfig {
        http_addr: config.http_addr(),
        https_addr: config.https_addr(),
        primary_domain: primary,
    };
    let listeners = ListenerManager::new(
        listener_config,
        store.clone(),
        provisioner.clone(),
        jobs.clone(),
        |control| -> Arc<dyn RequestHandler> {
            let gatekeeper = Gatekeeper::new(store.clone(), provisioner.clone(), jobs.clone(), control);
            Arc::new(GatewayService::new(gatekeeper, assets, proxy))
        },
    );

    if let Err(e) = listeners.start_plaintext().await {
        tracing::warn!(error = %e, "HTTP listener not bound yet");
    }
    if let Err(e) = listeners.ensure_tls_active().await {
        tracing::error!(error = %e, "HTTPS listener cannot start");
    }

    let refresher = sync.spawn_periodic(config.refresh_interval);

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    refresher.abort();
    listeners.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let _ = sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
