//! Entry page refresh from the origin
//!
//! The remote page embeds `<!-- dStore version X.Y.Z -->`. It replaces the
//! cached copy only when it carries a version strictly newer than the local
//! one (or the local copy has none). Replacement goes through a temp file in
//! the same directory and a rename, so readers never see a partial page.

use regex::Regex;
use std::cmp::Ordering;
use std::io::Write;
use std::num::IntErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

static VERSION_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<!-- dStore version (\d+\.\d+\.\d+) -->").ok());

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to replace entry page: {0}")]
    Persist(#[from] tempfile::PersistError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated { version: String },
    UpToDate { local: Option<String> },
    /// Remote page has no version marker
    NoRemoteVersion,
}

/// Version from the entry page marker, if present.
pub fn extract_version(html: &str) -> Option<&str> {
    VERSION_MARKER
        .as_ref()?
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Numeric value of one version component. Oversized components saturate
/// rather than wrapping; anything non-numeric counts as 0.
fn version_component(part: &str) -> u64 {
    match part.parse::<u64>() {
        Ok(n) => n,
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => u64::MAX,
        Err(_) => 0,
    }
}

/// Dotted-numeric comparison; missing or non-numeric parts count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(version_component).collect() };
    let (a, b) = (parse(a), parse(b));

    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn should_replace(local: Option<&str>, remote: &str) -> bool {
    match local {
        Some(local) => compare_versions(remote, local) == Ordering::Greater,
        None => true,
    }
}

pub struct ContentSync {
    client: reqwest::Client,
    source_url: String,
    entry_page: PathBuf,
}

impl ContentSync {
    pub fn new(client: reqwest::Client, source_url: &str, entry_page: PathBuf) -> Self {
        Self {
            client,
            source_url: source_url.to_string(),
            entry_page,
        }
    }

    /// Fetch the remote page and replace the cached copy if it is newer.
    pub async fn check_and_update(&self) -> Result<SyncOutcome, SyncError> {
        let fetch_err = |source| SyncError::Fetch {
            url: self.source_url.clone(),
            source,
        };
        let remote = self
            .client
            .get(&self.source_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(fetch_err)?
            .text()
            .await
            .map_err(fetch_err)?;

        let Some(remote_version) = extract_version(&remote) else {
            return Ok(SyncOutcome::NoRemoteVersion);
        };

        let local = match tokio::fs::read_to_string(&self.entry_page).await {
            Ok(contents) => extract_version(&contents).map(str::to_string),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if !should_replace(local.as_deref(), remote_version) {
            return Ok(SyncOutcome::UpToDate { local });
        }

        replace_atomically(&self.entry_page, remote.as_bytes())?;
        Ok(SyncOutcome::Updated {
            version: remote_version.to_string(),
        })
    }

    /// Run one check and log the outcome. Failures leave the cached page as is.
    pub async fn run_once(&self) {
        match self.check_and_update().await {
            Ok(SyncOutcome::Updated { version }) => {
                tracing::info!(version = %version, "Entry page updated");
            }
            Ok(SyncOutcome::UpToDate { local }) => {
                tracing::info!(version = local.as_deref().unwrap_or("-"), "Entry page is up to date");
            }
            Ok(SyncOutcome::NoRemoteVersion) => {
                tracing::warn!(url = %self.source_url, "Remote entry page has no version marker");
            }
            Err(e) => {
                tracing::error!(error = %e, "Entry page refresh failed");
            }
        }
    }

    /// Refresh every `interval`, starting one interval from now.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

fn replace_atomically(path: &Path, contents: &[u8]) -> Result<(), SyncError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
