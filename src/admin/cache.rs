//! Cache purge handler
//!
//! Manual invalidation by exact key, by project, or wholesale. Reads issued
//! after a purge returns observe misses. Every purge is audited.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::proxy::ProxyState;

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    /// Exact cache key to drop
    pub key: Option<String>,
    /// Drop every entry of one project
    pub project_id: Option<Uuid>,
    /// Drop everything
    #[serde(default)]
    pub all: bool,
}

pub async fn purge(
    State(state): State<ProxyState>,
    Json(body): Json<PurgeRequest>,
) -> (StatusCode, Json<Value>) {
    let (scope, removed) = if body.all {
        ("all", state.http_cache.purge_all().await)
    } else if let Some(project_id) = body.project_id {
        let prefix = state.http_cache.project_prefix(project_id);
        ("project", state.http_cache.purge_prefix(&prefix).await)
    } else if let Some(key) = &body.key {
        ("key", u64::from(state.http_cache.purge_key(key).await))
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": "invalid_request",
                "description": "one of key, project_id, or all is required"
            })),
        );
    };

    tracing::info!(scope, removed, "Cache purged");
    (StatusCode::OK, Json(json!({"scope": scope, "removed": removed})))
}
