//! Reverse proxy core
//!
//! The terminal stage of the middleware chain: gate the route on the
//! allowlist, swap the Authorization header for the project's upstream key,
//! forward, and stream the upstream response back byte for byte. Transport
//! failures map to 502/504; upstream error statuses pass through unchanged.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::Response,
    response::IntoResponse,
};
use std::net::SocketAddr;

use super::director;
use super::state::{BufferedBody, ProxyState};
use crate::auth::AuthContext;
use crate::error::ProxyError;
use crate::store::StoreError;

pub async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response<Body> {
    match forward(state, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward(state: ProxyState, req: Request) -> Result<Response<Body>, ProxyError> {
    let ctx = req
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or_else(|| ProxyError::Internal(anyhow::anyhow!("auth context missing")))?;

    let method = req.method().clone();
    let path = req.uri().path();

    director::check_allowlist(&state.allowlist, &method, path)?;

    let upstream_key = match state.store.get_upstream_key(ctx.project_id).await {
        Ok(key) => key,
        // Project vanished between guard and forward: treat as deactivated
        Err(StoreError::ProjectNotFound) => return Err(ProxyError::ProjectInactive),
        Err(err) => return Err(ProxyError::Store(err.into())),
    };

    let body = req
        .extensions()
        .get::<BufferedBody>()
        .map(|b| b.0.clone())
        .unwrap_or_default();

    let client_addr = state
        .config
        .forward_client_ip
        .then(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0)
        })
        .flatten();

    let upstream_request = director::build_upstream_request(
        &state.client,
        &state.config.upstream_base_url,
        method.clone(),
        path,
        req.uri().query(),
        req.headers(),
        body,
        &upstream_key,
        client_addr,
    );

    tracing::debug!(%method, path, "Forwarding to upstream");

    let upstream = upstream_request
        .send()
        .await
        .map_err(ProxyError::from_upstream)?;

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if director::is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::Internal(anyhow::anyhow!(e)))
}
