//! Token CRUD handlers
//!
//! The full token string is returned exactly once, from the creation call.
//! Every later read obfuscates it. Revocation invalidates the hot-path
//! token cache before the response is written.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::generate_token_string;
use crate::proxy::ProxyState;
use crate::store::{StoreError, TokenFilter, TokenPatch, TokenRecord};
use crate::util::obfuscate_secret;

fn token_view(token: &TokenRecord) -> Value {
    json!({
        "id": token.id,
        "token": obfuscate_secret(&token.token),
        "project_id": token.project_id,
        "expires_at": token.expires_at,
        "is_active": token.is_active,
        "request_count": token.request_count,
        "max_requests": token.max_requests,
        "cache_hit_count": token.cache_hit_count,
        "created_at": token.created_at,
        "last_used_at": token.last_used_at,
    })
}

fn store_error(err: StoreError) -> (StatusCode, Json<Value>) {
    match err {
        StoreError::ProjectNotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "project_not_found", "description": "project not found"})),
        ),
        StoreError::TokenNotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "token_not_found", "description": "token not found"})),
        ),
        StoreError::Backend(err) => {
            tracing::error!(error = %err, "Store error in management call");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"code": "storage_error", "description": "storage error"})),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateToken {
    pub project_id: Uuid,
    /// Lifetime in seconds; omitted means the token never expires
    pub ttl_secs: Option<i64>,
    pub max_requests: Option<u64>,
}

pub async fn create_token(
    State(state): State<ProxyState>,
    Json(body): Json<CreateToken>,
) -> (StatusCode, Json<Value>) {
    if matches!(body.ttl_secs, Some(secs) if secs <= 0) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": "invalid_request", "description": "ttl_secs must be positive"})),
        );
    }

    let now = Utc::now();
    let record = TokenRecord {
        id: Uuid::new_v4(),
        token: generate_token_string(),
        project_id: body.project_id,
        expires_at: body.ttl_secs.map(|secs| now + Duration::seconds(secs)),
        is_active: true,
        request_count: 0,
        max_requests: body.max_requests,
        cache_hit_count: 0,
        created_at: now,
        last_used_at: None,
    };

    match state.store.create_token(record).await {
        Ok(token) => {
            tracing::info!(
                token_id = %token.id,
                project_id = %token.project_id,
                token = %obfuscate_secret(&token.token),
                "Token created"
            );
            // The one place the full token string is disclosed
            let mut view = token_view(&token);
            view["token"] = json!(token.token);
            (StatusCode::CREATED, Json(view))
        }
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTokensQuery {
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub active_only: bool,
}

pub async fn list_tokens(
    State(state): State<ProxyState>,
    Query(query): Query<ListTokensQuery>,
) -> (StatusCode, Json<Value>) {
    let filter = TokenFilter {
        project_id: query.project_id,
        active_only: query.active_only,
    };
    match state.store.list_tokens(filter).await {
        Ok(tokens) => {
            let list: Vec<Value> = tokens.iter().map(token_view).collect();
            (
                StatusCode::OK,
                Json(json!({"list": list, "total": list.len()})),
            )
        }
        Err(err) => store_error(err),
    }
}

pub async fn get_token(
    State(state): State<ProxyState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    match state.store.get_token(&id.to_string()).await {
        Ok(token) => (StatusCode::OK, Json(token_view(&token))),
        Err(err) => store_error(err),
    }
}

pub async fn update_token(
    State(state): State<ProxyState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<TokenPatch>,
) -> (StatusCode, Json<Value>) {
    let revoking = patch.is_active == Some(false);
    match state.store.update_token(id, patch).await {
        Ok(token) => {
            if revoking {
                state.token_cache.invalidate(&token.token);
            }
            tracing::info!(token_id = %id, "Token updated");
            (StatusCode::OK, Json(token_view(&token)))
        }
        Err(err) => store_error(err),
    }
}

pub async fn revoke_token(State(state): State<ProxyState>, Path(id): Path<Uuid>) -> Response {
    match state.store.revoke_token(id).await {
        Ok(token) => {
            // Synchronous invalidation: the next request with this token
            // misses the cache and sees the revocation
            state.token_cache.invalidate(&token.token);
            tracing::info!(
                token_id = %id,
                token = %obfuscate_secret(&token.token),
                "Token revoked"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err).into_response(),
    }
}
