use std::time::Duration;

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

pub const DATA_DIR: &str = "/dstore";
pub const ORIGIN_URL: &str = "https://db.dstore.one";
pub const PWA_FALLBACK_URL: &str = "https://cdn.dstore.one/pwa.json";
pub const PROVISION_COMMAND: &str = "update_certificates.sh";

/// Wait after the provisioning command exits before the plaintext listener
/// takes port 80 back.
pub const PROVISION_SETTLE_DELAY: Duration = Duration::from_secs(10);
/// Delay before retrying a TLS bind that found no complete bundle.
pub const TLS_RETRY_DELAY: Duration = Duration::from_millis(1500);
/// Consecutive TLS bind retries before giving up until the next restart.
pub const TLS_RETRY_LIMIT: u32 = 40;
pub const CONTENT_REFRESH_INTERVAL_HOURS: u64 = 12;
pub const CONTENT_REFRESH_INTERVAL: Duration =
    Duration::from_secs(CONTENT_REFRESH_INTERVAL_HOURS * 60 * 60);

/// Host prefixes that qualify for on-demand certificates.
pub const PROVISIONED_HOST_PREFIXES: &[&str] = &["store.", "s.", "apps.", "dstore."];
/// Hosts starting with this prefix are the origin's own canonical host; upstream
/// redirects are not relayed verbatim for them.
pub const CANONICAL_HOST_PREFIX: &str = "db.";

pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
