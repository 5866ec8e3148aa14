// Proxy module - HTTP server fronting the upstream LLM API
//
// This module wires the middleware chain and reverse proxy core into an
// axum server. Requests carry a validated auth context through extensions;
// responses stream back with tee wrappers for the cache and the event
// pipeline.

mod director;
mod handler;
mod middleware;
mod state;
mod streaming;

pub use director::{build_upstream_request, check_allowlist, is_hop_by_hop, is_streaming_response};
pub use state::{BufferedBody, ProxyState, RequestId};
pub use streaming::CaptureStream;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{middleware::from_fn, middleware::from_fn_with_state, routing::any, Router};
use tokio::net::TcpListener;

use crate::admin;
use crate::config::Config;

/// Build the upstream HTTP client. One pooled transport for the process;
/// the per-request deadline is bound here.
pub fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create HTTP client")
}

/// Compose the full application router: health endpoints, the management
/// surface when an admin token is configured, and the proxy wildcard wrapped
/// in the middleware chain.
pub fn build_app(state: ProxyState) -> Router {
    // Router::layer wraps everything added so far, so the layer added last
    // runs first; this listing is innermost to outermost.
    let proxy_routes = Router::new()
        .route("/*path", any(handler::proxy_handler))
        .layer(from_fn_with_state(state.clone(), middleware::http_cache))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn_with_state(state.clone(), middleware::project_guard))
        .layer(from_fn_with_state(state.clone(), middleware::token_validation))
        .layer(from_fn_with_state(state.clone(), middleware::instrumentation))
        .layer(from_fn(middleware::request_id))
        .with_state(state.clone());

    let mut app = Router::new()
        .route("/healthz", axum::routing::get(admin::healthz))
        .route("/readyz", axum::routing::get(admin::readyz))
        .with_state(state.clone());

    if state.config.admin.token.is_some() {
        app = app.nest("/admin", admin::router(state.clone()));
    } else {
        tracing::warn!("No admin token configured; management endpoints disabled");
    }

    app.merge(proxy_routes)
}

/// Start the proxy server
pub async fn start_proxy(
    state: ProxyState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let listen_addr = state.config.listen_addr;
    let app = build_app(state);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;

    tracing::info!("Proxy listening on {listen_addr}");

    // Graceful shutdown: stop accepting, let in-flight requests finish
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_rx.await.ok();
    })
    .await
    .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}
