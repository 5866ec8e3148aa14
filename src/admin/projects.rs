//! Project CRUD handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::proxy::ProxyState;
use crate::store::{Project, ProjectPatch, StoreError};
use crate::util::obfuscate_secret;

/// API view of a project; the upstream key only ever leaves obfuscated.
fn project_view(project: &Project) -> Value {
    json!({
        "id": project.id,
        "name": project.name,
        "upstream_key": obfuscate_secret(&project.upstream_key),
        "is_active": project.is_active,
        "created_at": project.created_at,
        "updated_at": project.updated_at,
        "deactivated_at": project.deactivated_at,
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
pub struct CreateProject {
    pub name: String,
    pub upstream_key: String,
}

pub async fn create_project(
    State(state): State<ProxyState>,
    Json(body): Json<CreateProject>,
) -> (StatusCode, Json<Value>) {
    if body.name.trim().is_empty() || body.upstream_key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": "invalid_request", "description": "name and upstream_key are required"})),
        );
    }

    let project = Project::new(body.name, body.upstream_key);
    match state.store.create_project(project).await {
        Ok(project) => {
            tracing::info!(project_id = %project.id, name = %project.name, "Project created");
            (StatusCode::CREATED, Json(project_view(&project)))
        }
        Err(err) => store_error(err),
    }
}

pub async fn list_projects(State(state): State<ProxyState>) -> (StatusCode, Json<Value>) {
    match state.store.list_projects().await {
        Ok(projects) => {
            let list: Vec<Value> = projects.iter().map(project_view).collect();
            (
                StatusCode::OK,
                Json(json!({"list": list, "total": list.len()})),
            )
        }
        Err(err) => store_error(err),
    }
}

pub async fn get_project(
    State(state): State<ProxyState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    match state.store.get_project(id).await {
        Ok(project) => (StatusCode::OK, Json(project_view(&project))),
        Err(err) => store_error(err),
    }
}

pub async fn update_project(
    State(state): State<ProxyState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<ProjectPatch>,
) -> (StatusCode, Json<Value>) {
    let deactivating = patch.is_active == Some(false);
    match state.store.update_project(id, patch).await {
        Ok(project) => {
            // The next request must observe the new state
            state.project_cache.invalidate(id);
            if deactivating {
                state.token_cache.invalidate_project(id);
            }
            tracing::info!(project_id = %id, "Project updated");
            (StatusCode::OK, Json(project_view(&project)))
        }
        Err(err) => store_error(err),
    }
}

pub async fn delete_project(State(state): State<ProxyState>, Path(id): Path<Uuid>) -> Response {
    match state.store.delete_project(id).await {
        Ok(()) => {
            state.project_cache.invalidate(id);
            state.token_cache.invalidate_project(id);
            tracing::info!(project_id = %id, "Project deactivated");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err).into_response(),
    }
}
