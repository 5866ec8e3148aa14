//! Management surface
//!
//! Project and token CRUD, cache purges, and component metrics, mounted
//! under `/admin` behind an exact-match bearer token. Tokens appear in full
//! exactly once, in the creation response; everywhere else secrets are
//! obfuscated. Health endpoints live outside the authenticated scope.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::time::Duration;

mod cache;
mod projects;
mod tokens;

use crate::proxy::ProxyState;

/// Assemble the authenticated management router.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/:id",
            get(projects::get_project)
                .patch(projects::update_project)
                .delete(projects::delete_project),
        )
        .route(
            "/tokens",
            get(tokens::list_tokens).post(tokens::create_token),
        )
        .route(
            "/tokens/:id",
            get(tokens::get_token)
                .patch(tokens::update_token)
                .delete(tokens::revoke_token),
        )
        .route("/cache/purge", post(cache::purge))
        .route("/metrics", get(metrics))
        .layer(from_fn_with_state(state.clone(), bearer_auth))
        .with_state(state)
}

/// Exact-match admin bearer authentication.
async fn bearer_auth(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.config.admin.token.as_deref() else {
        // Router is only mounted when a token is configured
        return StatusCode::NOT_FOUND.into_response();
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if presented != Some(expected) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": "unauthorized", "description": "invalid management token"})),
        )
            .into_response();
    }
    next.run(req).await
}

/// Counter snapshot from every process-wide singleton.
async fn metrics(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({
        "token_cache": state.token_cache.metrics(),
        "rate_limiter": state.rate_limiter.metrics(),
        "http_cache": state.http_cache.metrics(),
        "stats": state.stats.metrics(),
        "bus": state.bus.metrics(),
        "dispatcher": state.dispatcher.metrics(),
    }))
}

/// Liveness: the process is up.
pub async fn healthz() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// Readiness: the store answers a trivial query within a short deadline.
pub async fn readyz(State(state): State<ProxyState>) -> (StatusCode, Json<Value>) {
    match tokio::time::timeout(Duration::from_secs(2), state.store.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({"status": "ready"}))),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "Readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "store unavailable"})),
            )
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "store timeout"})),
        ),
    }
}
