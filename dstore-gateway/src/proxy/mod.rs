//! Reverse proxy to the origin
//!
//! One forwarding attempt per request. Request and response bodies are
//! streamed; redirects are relayed verbatim unless the client is talking to
//! the origin's canonical host.

mod headers;

use headers::{relayed_redirect, relayed_response_headers, upstream_request_headers};

use crate::defaults::UPSTREAM_CONNECT_TIMEOUT;
use crate::service::{BoxError, GatewayBody, empty, text_response};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::{Method, Request, Response, StatusCode, header};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{0}")]
    Upstream(#[from] reqwest::Error),
}

/// Host the client addressed, from `Host` or the HTTP/2 authority.
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
}

pub struct OriginProxy {
    client: reqwest::Client,
    origin: String,
}

impl OriginProxy {
    pub fn new(origin: &str) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .build()
            .map_err(ProxyError::Client)?;

        Ok(Self {
            client,
            origin: origin.trim_end_matches('/').to_string(),
        })
    }

    pub async fn forward<B>(&self, req: Request<B>, https: bool) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let host = request_host(&req).unwrap_or_default().to_string();

        match self.send(req, https, &host).await {
            Ok(upstream) => relay(upstream, &host),
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Upstream request failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn send<B>(
        &self,
        req: Request<B>,
        https: bool,
        host: &str,
    ) -> Result<reqwest::Response, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let scheme = if https { "https" } else { "http" };
        let referer = format!("{scheme}://{host}{path_and_query}");
        let url = format!("{}{}", self.origin, path_and_query);

        let mut request = self
            .client
            .request(parts.method.clone(), &url)
            .headers(upstream_request_headers(&parts.headers, &referer));
        if parts.method != Method::GET && parts.method != Method::HEAD {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        tracing::debug!(method = %parts.method, url = %url, "Forwarding to origin");
        Ok(request.send().await?)
    }
}

fn relay(upstream: reqwest::Response, inbound_host: &str) -> Response<GatewayBody> {
    let status = upstream.status();

    if let Some(location) = relayed_redirect(status, upstream.headers(), inbound_host) {
        let mut response = Response::new(empty());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::LOCATION, location.clone());
        return response;
    }

    let headers = relayed_response_headers(upstream.headers());
    let body = StreamBody::new(
        upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(BoxError::from),
    );

    let mut response = Response::new(body.boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
