use std::path::{Path, PathBuf};

/// On-disk layout under the gateway's storage root.
///
/// ```text
/// {root}/dstore.html          cached entry page
/// {root}/apps.json            apps manifest
/// {root}/pwa.json             PWA manifest
/// {root}/domains.txt          newline-delimited domain allow-list
/// {root}/cert/{domain}/       privkey.pem, cert.pem, chain.pem
/// ```
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cert_root(&self) -> PathBuf {
        self.root.join("cert")
    }

    pub fn entry_page(&self) -> PathBuf {
        self.root.join("dstore.html")
    }

    pub fn apps_manifest(&self) -> PathBuf {
        self.root.join("apps.json")
    }

    pub fn pwa_manifest(&self) -> PathBuf {
        self.root.join("pwa.json")
    }

    pub fn domain_list(&self) -> PathBuf {
        self.root.join("domains.txt")
    }
}

/// If `dstore-gateway` is being run from a path under a `target/` directory, return that
/// `target/` directory path.
pub fn target_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// Default data dir for debug builds when running from a source checkout.
///
/// Example: `{repo}/local-dev/dstore-gateway/data`
pub fn debug_default_data_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let repo = target_dir_from_exe(exe_path)?.parent()?.to_path_buf();
    Some(repo.join("local-dev").join("dstore-gateway").join("data"))
}
