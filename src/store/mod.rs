//! Persistence for projects and withering tokens
//!
//! The store is a trait seam with two backends: SQLite for real deployments
//! and an in-memory map for development and tests. Single-row reads are
//! linearizable; counter updates are delta increments
//! (`SET n = n + delta`, never an absolute write) so retries and
//! out-of-order delivery cannot lose or duplicate counts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A tenant holding an upstream API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// Upstream API key; never serialized to clients in clear (see admin layer)
    pub upstream_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(name: String, upstream_key: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            upstream_key,
            is_active: true,
            created_at: now,
            updated_at: now,
            deactivated_at: None,
        }
    }
}

/// A withering token scoped to one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: Uuid,
    /// The full token string; the lookup key on the hot path
    pub token: String,
    pub project_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub request_count: u64,
    pub max_requests: Option<u64>,
    pub cache_hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Why a token is not usable right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidity {
    Valid,
    Revoked,
    Expired,
    Exhausted,
}

impl TokenRecord {
    /// Token-local validity; the owning project's state is checked separately.
    ///
    /// `expires_at == now` counts as expired and
    /// `request_count == max_requests` counts as exhausted.
    pub fn validity(&self, now: DateTime<Utc>) -> TokenValidity {
        if !self.is_active {
            return TokenValidity::Revoked;
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return TokenValidity::Expired;
            }
        }
        if let Some(max) = self.max_requests {
            if self.request_count >= max {
                return TokenValidity::Exhausted;
            }
        }
        TokenValidity::Valid
    }
}

/// Partial project update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub upstream_key: Option<String>,
    pub is_active: Option<bool>,
}

/// Partial token update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenPatch {
    pub is_active: Option<bool>,
    pub max_requests: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenFilter {
    pub project_id: Option<Uuid>,
    pub active_only: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("project not found")]
    ProjectNotFound,
    #[error("token not found")]
    TokenNotFound,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence contract for projects and tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Trivial round trip for readiness probes.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_project(&self, project: Project) -> Result<Project, StoreError>;
    async fn get_project(&self, id: Uuid) -> Result<Project, StoreError>;
    async fn update_project(&self, id: Uuid, patch: ProjectPatch) -> Result<Project, StoreError>;
    /// Soft delete: clears `is_active` and stamps `deactivated_at`.
    async fn delete_project(&self, id: Uuid) -> Result<(), StoreError>;
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    async fn get_upstream_key(&self, project_id: Uuid) -> Result<String, StoreError>;
    /// Cheap existence + active check for the hot path.
    async fn is_project_active(&self, project_id: Uuid) -> Result<bool, StoreError>;

    async fn create_token(&self, token: TokenRecord) -> Result<TokenRecord, StoreError>;
    /// Accepts either a token id (UUID) or the full token string.
    async fn get_token(&self, id_or_token: &str) -> Result<TokenRecord, StoreError>;
    async fn list_tokens(&self, filter: TokenFilter) -> Result<Vec<TokenRecord>, StoreError>;
    async fn update_token(&self, id: Uuid, patch: TokenPatch) -> Result<TokenRecord, StoreError>;
    /// Clears `is_active`; returns the record so callers can invalidate caches.
    async fn revoke_token(&self, id: Uuid) -> Result<TokenRecord, StoreError>;

    /// Delta increment; also stamps `last_used_at`. Increments against
    /// revoked tokens are accepted (idempotent, monotonic).
    async fn increment_request_count(&self, token_id: Uuid, delta: u64) -> Result<(), StoreError>;
    async fn increment_cache_hits(&self, token_id: Uuid, delta: u64) -> Result<(), StoreError>;
}
