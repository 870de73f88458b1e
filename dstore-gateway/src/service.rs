//! Per-request pipeline shared by both listeners
//!
//! gatekeeper check → local asset or origin proxy → access log

use crate::assets::{Assets, LocalAsset};
use crate::gatekeeper::Gatekeeper;
use crate::listener::RequestHandler;
use crate::proxy::{OriginProxy, request_host};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::{Request, Response, StatusCode, header};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body for everything the gateway sends
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> GatewayBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Where a request path is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local(LocalAsset),
    Origin,
}

pub fn route(path: &str) -> Route {
    match path {
        "/" => Route::Local(LocalAsset::EntryPage),
        "/apps.json" => Route::Local(LocalAsset::AppsManifest),
        "/pwa.json" => Route::Local(LocalAsset::PwaManifest),
        _ => Route::Origin,
    }
}

pub struct GatewayService {
    gatekeeper: Gatekeeper,
    assets: Assets,
    proxy: OriginProxy,
}

impl GatewayService {
    pub fn new(gatekeeper: Gatekeeper, assets: Assets, proxy: OriginProxy) -> Self {
        Self {
            gatekeeper,
            assets,
            proxy,
        }
    }

    pub async fn serve<B>(&self, req: Request<B>, https: bool) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let host = request_host(&req).map(str::to_string);
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if let Some(host) = &host {
            self.gatekeeper.observe(host).await;
        }

        let response = match route(&path) {
            Route::Local(asset) => self.assets.serve(asset, &method).await,
            Route::Origin => self.proxy.forward(req, https).await,
        };

        tracing::info!(
            host = host.as_deref().unwrap_or("-"),
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            https = https,
            "Request completed"
        );
        response
    }
}

#[async_trait]
impl RequestHandler for GatewayService {
    async fn handle(&self, req: Request<Incoming>, https: bool) -> Response<GatewayBody> {
        self.serve(req, https).await
    }
}
