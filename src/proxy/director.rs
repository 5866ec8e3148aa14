//! Upstream request direction
//!
//! Validates the request against the provider allowlist, rewrites the
//! Authorization header to the project's upstream key, strips hop-by-hop
//! headers, and points the request at the configured upstream. Bytes are
//! never transformed here.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use std::net::SocketAddr;

use crate::config::{Allowlist, RouteMatch};
use crate::error::ProxyError;

/// Hop-by-hop headers are connection-scoped and never forwarded in either
/// direction (RFC 9110 §7.6.1).
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Gate the request on the provider allowlist.
pub fn check_allowlist(
    allowlist: &Allowlist,
    method: &Method,
    path: &str,
) -> Result<(), ProxyError> {
    match allowlist.check(method, path) {
        RouteMatch::Allowed => Ok(()),
        RouteMatch::UnknownPath => Err(ProxyError::PathNotAllowed),
        RouteMatch::MethodNotAllowed => Err(ProxyError::MethodNotAllowed),
    }
}

/// Build the upstream request. The client's Authorization (the withering
/// token) is dropped and replaced with the project's upstream key.
#[allow(clippy::too_many_arguments)]
pub fn build_upstream_request(
    client: &reqwest::Client,
    base_url: &str,
    method: Method,
    path: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    upstream_key: &str,
    client_addr: Option<SocketAddr>,
) -> reqwest::RequestBuilder {
    let mut url = format!("{}{}", base_url.trim_end_matches('/'), path);
    if let Some(query) = raw_query {
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }

    let mut request = client.request(method, &url).body(body);

    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) {
            continue;
        }
        // Host and framing are rebuilt by the client; credentials are replaced
        if name_str == "host" || name_str == "content-length" || name_str == "authorization" {
            continue;
        }
        request = request.header(name, value);
    }

    request = request.header("authorization", format!("Bearer {upstream_key}"));

    if let Some(addr) = client_addr {
        request = request.header("x-forwarded-for", addr.ip().to_string());
    }

    request
}

/// Is the upstream response produced incrementally? Server-sent events and
/// responses without a declared length stream chunk by chunk.
pub fn is_streaming_response(headers: &HeaderMap) -> bool {
    let sse = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);
    sse || !headers.contains_key("content-length")
}
