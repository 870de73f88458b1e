//! Local delivery of the entry page and the two JSON manifests
//!
//! Files live directly under the storage root and are read on every request,
//! so a refreshed entry page or an edited manifest is served immediately.

use crate::paths::StoragePaths;
use crate::service::{GatewayBody, empty, full, text_response};
use hyper::header::{self, HeaderValue};
use hyper::{Method, Response, StatusCode};
use std::path::Path;
use thiserror::Error;

const PWA_FETCH_ERROR: &str = "An error occurred while fetching data.";

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAsset {
    /// `/`
    EntryPage,
    /// `/apps.json`
    AppsManifest,
    /// `/pwa.json`
    PwaManifest,
}

pub struct Assets {
    paths: StoragePaths,
    origin_url: String,
    pwa_fallback_url: String,
    client: reqwest::Client,
}

impl Assets {
    pub fn new(
        paths: StoragePaths,
        origin_url: &str,
        pwa_fallback_url: &str,
        client: reqwest::Client,
    ) -> Self {
        Self {
            paths,
            origin_url: origin_url.to_string(),
            pwa_fallback_url: pwa_fallback_url.to_string(),
            client,
        }
    }

    /// Create `apps.json` as an empty object when it does not exist yet.
    ///
    /// Returns whether the file was created.
    pub fn ensure_apps_manifest(&self) -> Result<bool, AssetError> {
        let path = self.paths.apps_manifest();
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, b"{}")?;
        tracing::info!(path = %path.display(), "Created empty apps manifest");
        Ok(true)
    }

    pub async fn serve(&self, asset: LocalAsset, method: &Method) -> Response<GatewayBody> {
        if *method != Method::GET && *method != Method::HEAD {
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        match asset {
            LocalAsset::EntryPage => self.entry_page().await,
            LocalAsset::AppsManifest => self.apps_manifest().await,
            LocalAsset::PwaManifest => self.pwa_manifest().await,
        }
    }

    async fn entry_page(&self) -> Response<GatewayBody> {
        match read_optional(&self.paths.entry_page()).await {
            Ok(Some(contents)) => content_response(contents, "text/html; charset=utf-8"),
            Ok(None) => redirect(&self.origin_url),
            Err(e) => read_failure("entry page", e),
        }
    }

    async fn apps_manifest(&self) -> Response<GatewayBody> {
        match read_optional(&self.paths.apps_manifest()).await {
            Ok(Some(contents)) => content_response(contents, "application/json"),
            Ok(None) => text_response(StatusCode::NOT_FOUND, "File not found"),
            Err(e) => read_failure("apps manifest", e),
        }
    }

    async fn pwa_manifest(&self) -> Response<GatewayBody> {
        match read_optional(&self.paths.pwa_manifest()).await {
            Ok(Some(contents)) => return content_response(contents, "application/json"),
            Ok(None) => {}
            Err(e) => return read_failure("PWA manifest", e),
        }

        match self.fetch_pwa_fallback().await {
            Ok(manifest) => content_response(manifest, "application/json"),
            Err(e) => {
                tracing::warn!(error = %e, "PWA manifest fallback failed");
                let body = serde_json::json!({ "error": PWA_FETCH_ERROR }).to_string();
                let mut response = content_response(body.into_bytes(), "application/json");
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    async fn fetch_pwa_fallback(&self) -> Result<Vec<u8>, AssetError> {
        let url = &self.pwa_fallback_url;
        let fetch_err = |source| AssetError::Fetch {
            url: url.clone(),
            source,
        };

        // Relayed as received
        let manifest = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(fetch_err)?
            .bytes()
            .await
            .map_err(fetch_err)?;
        Ok(manifest.to_vec())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, AssetError> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn content_response(contents: Vec<u8>, content_type: &'static str) -> Response<GatewayBody> {
    let mut response = Response::new(full(contents));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn redirect(location: &str) -> Response<GatewayBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

fn read_failure(what: &str, e: AssetError) -> Response<GatewayBody> {
    tracing::error!(error = %e, "Failed to read {}", what);
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
}
