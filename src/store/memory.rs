//! In-memory store backend
//!
//! Backs the `memory` store driver and the test suite. All state lives in a
//! single RwLock'd map set; lock sections are short and never held across
//! await points.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    Project, ProjectPatch, StoreError, TokenFilter, TokenPatch, TokenRecord, TokenStore,
};

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, Project>,
    tokens: HashMap<Uuid, TokenRecord>,
    /// token string -> token id, the hot-path lookup
    token_index: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> StoreError {
        StoreError::Backend(anyhow::anyhow!("store lock poisoned"))
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.read().map_err(|_| Self::lock_err())?;
        Ok(())
    }

    async fn create_project(&self, project: Project) -> Result<Project, StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<Project, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        inner
            .projects
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProjectNotFound)
    }

    async fn update_project(&self, id: Uuid, patch: ProjectPatch) -> Result<Project, StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let project = inner
            .projects
            .get_mut(&id)
            .ok_or(StoreError::ProjectNotFound)?;
        if let Some(name) = patch.name {
            project.name = name;
        }
        if let Some(key) = patch.upstream_key {
            project.upstream_key = key;
        }
        if let Some(active) = patch.is_active {
            project.is_active = active;
            project.deactivated_at = if active { None } else { Some(Utc::now()) };
        }
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    async fn delete_project(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let project = inner
            .projects
            .get_mut(&id)
            .ok_or(StoreError::ProjectNotFound)?;
        project.is_active = false;
        project.deactivated_at = Some(Utc::now());
        project.updated_at = Utc::now();
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn get_upstream_key(&self, project_id: Uuid) -> Result<String, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        inner
            .projects
            .get(&project_id)
            .map(|p| p.upstream_key.clone())
            .ok_or(StoreError::ProjectNotFound)
    }

    async fn is_project_active(&self, project_id: Uuid) -> Result<bool, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        Ok(inner
            .projects
            .get(&project_id)
            .map(|p| p.is_active)
            .unwrap_or(false))
    }

    async fn create_token(&self, token: TokenRecord) -> Result<TokenRecord, StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        if !inner.projects.contains_key(&token.project_id) {
            return Err(StoreError::ProjectNotFound);
        }
        inner.token_index.insert(token.token.clone(), token.id);
        inner.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn get_token(&self, id_or_token: &str) -> Result<TokenRecord, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        let id = match id_or_token.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => *inner
                .token_index
                .get(id_or_token)
                .ok_or(StoreError::TokenNotFound)?,
        };
        inner
            .tokens
            .get(&id)
            .cloned()
            .ok_or(StoreError::TokenNotFound)
    }

    async fn list_tokens(&self, filter: TokenFilter) -> Result<Vec<TokenRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        let mut tokens: Vec<TokenRecord> = inner
            .tokens
            .values()
            .filter(|t| filter.project_id.map(|p| t.project_id == p).unwrap_or(true))
            .filter(|t| !filter.active_only || t.is_active)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    async fn update_token(&self, id: Uuid, patch: TokenPatch) -> Result<TokenRecord, StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let token = inner.tokens.get_mut(&id).ok_or(StoreError::TokenNotFound)?;
        if let Some(active) = patch.is_active {
            token.is_active = active;
        }
        if let Some(max) = patch.max_requests {
            token.max_requests = Some(max);
        }
        if let Some(expires_at) = patch.expires_at {
            token.expires_at = Some(expires_at);
        }
        Ok(token.clone())
    }

    async fn revoke_token(&self, id: Uuid) -> Result<TokenRecord, StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let token = inner.tokens.get_mut(&id).ok_or(StoreError::TokenNotFound)?;
        token.is_active = false;
        Ok(token.clone())
    }

    async fn increment_request_count(&self, token_id: Uuid, delta: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or(StoreError::TokenNotFound)?;
        token.request_count += delta;
        token.last_used_at = Some(Utc::now());
        Ok(())
    }

    async fn increment_cache_hits(&self, token_id: Uuid, delta: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or(StoreError::TokenNotFound)?;
        token.cache_hit_count += delta;
        Ok(())
    }
}
