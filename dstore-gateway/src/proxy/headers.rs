//! Header rules for forwarding to and relaying from the origin

use crate::defaults::CANONICAL_HOST_PREFIX;
use hyper::StatusCode;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Never copied from an upstream response
pub const RESPONSE_HOP_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// Connection-scoped request headers the client sets for its own leg
const REQUEST_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const REDIRECT_STATUSES: &[StatusCode] = &[
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

/// Headers sent upstream: the client's headers without `Host` and hop-by-hop
/// entries, with `Referer` pointing at the URL the client asked for.
pub fn upstream_request_headers(inbound: &HeaderMap, referer: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        if *name == header::HOST || is_listed(name, REQUEST_HOP_HEADERS) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match HeaderValue::from_str(referer) {
        Ok(value) => {
            headers.insert(header::REFERER, value);
        }
        Err(_) => {
            headers.remove(header::REFERER);
        }
    }
    headers
}

/// Response headers to relay to the client.
pub fn relayed_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !is_listed(name, RESPONSE_HOP_HEADERS) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Whether `host` is the origin's own canonical host (`db.`), matched
/// case-insensitively.
pub fn is_canonical_host(host: &str) -> bool {
    host.get(..CANONICAL_HOST_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(CANONICAL_HOST_PREFIX))
}

/// The redirect to relay verbatim, if the upstream answered with one and the
/// inbound host is not the canonical origin host.
pub fn relayed_redirect<'a>(
    status: StatusCode,
    headers: &'a HeaderMap,
    inbound_host: &str,
) -> Option<&'a HeaderValue> {
    if !REDIRECT_STATUSES.contains(&status) || is_canonical_host(inbound_host) {
        return None;
    }
    headers.get(header::LOCATION)
}

fn is_listed(name: &HeaderName, list: &[&str]) -> bool {
    list.contains(&name.as_str())
}
