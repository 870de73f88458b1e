use crate::defaults;
use crate::paths::StoragePaths;
use clap::{Parser, ValueEnum};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// dStore Gateway - storefront edge with on-demand TLS
#[derive(Debug, Parser)]
#[command(name = "dstore-gateway")]
#[command(version)]
#[command(about = "dStore Gateway - storefront edge with on-demand TLS")]
pub struct Args {
    /// Primary domain served by the TLS listener
    #[arg(long, env = "DOMAIN")]
    pub domain: String,

    /// Storage root for certificates, the entry page and manifests
    #[arg(long, env = "DSTORE_DATA_DIR")]
    pub data_dir: Option<String>,

    /// HTTP port
    #[arg(long, default_value_t = defaults::HTTP_PORT)]
    pub port: u16,

    /// HTTPS port
    #[arg(long, default_value_t = defaults::HTTPS_PORT)]
    pub tls_port: u16,

    /// Origin that non-local paths are proxied to
    #[arg(long, default_value = defaults::ORIGIN_URL)]
    pub origin: String,

    /// Remote PWA manifest used when pwa.json is missing locally
    #[arg(long, default_value = defaults::PWA_FALLBACK_URL)]
    pub pwa_fallback_url: String,

    /// Certificate provisioning command, invoked as `<command> <domain>`
    #[arg(long, default_value = defaults::PROVISION_COMMAND)]
    pub provision_command: String,

    /// Entry page refresh interval in hours
    #[arg(long, default_value_t = defaults::CONTENT_REFRESH_INTERVAL_HOURS)]
    pub refresh_interval_hours: u64,

    /// Minimum seconds between a failed provisioning attempt and the next one
    /// for the same host (0 retries on the next request)
    #[arg(long, default_value_t = 0)]
    pub provision_cooldown_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub domain: String,
    pub data_dir: PathBuf,
    pub http_port: u16,
    pub https_port: u16,
    pub origin: String,
    pub pwa_fallback_url: String,
    pub provision_command: String,
    pub refresh_interval: Duration,
    pub provision_cooldown: Duration,
}

impl GatewayConfig {
    /// Resolve CLI arguments. Debug builds run from a source checkout default
    /// the data dir into the checkout instead of `/dstore`.
    pub fn from_args(args: &Args, exe: Option<&Path>) -> Self {
        let data_dir = args.data_dir.clone().map(PathBuf::from).unwrap_or_else(|| {
            if cfg!(debug_assertions)
                && let Some(exe) = exe
                && let Some(p) = crate::paths::debug_default_data_dir_from_exe(exe)
            {
                return p;
            }
            PathBuf::from(defaults::DATA_DIR)
        });

        Self {
            domain: args.domain.trim().to_ascii_lowercase(),
            data_dir,
            http_port: args.port,
            https_port: args.tls_port,
            origin: args.origin.trim_end_matches('/').to_string(),
            pwa_fallback_url: args.pwa_fallback_url.clone(),
            provision_command: args.provision_command.clone(),
            refresh_interval: Duration::from_secs(
                args.refresh_interval_hours.clamp(1, 24 * 365) * 60 * 60,
            ),
            provision_cooldown: Duration::from_secs(args.provision_cooldown_secs),
        }
    }

    pub fn storage(&self) -> StoragePaths {
        StoragePaths::new(&self.data_dir)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.http_port))
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.https_port))
    }
}
