//! SQLite store backend
//!
//! Uses a small r2d2 connection pool in WAL mode; every call runs on the
//! blocking thread pool so the async runtime never waits on SQLite.
//! Schema changes are applied through versioned, idempotent migrations.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    Project, ProjectPatch, StoreError, TokenFilter, TokenPatch, TokenRecord, TokenStore,
};

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                PRAGMA foreign_keys=ON;
                "#,
            )
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("building sqlite pool")?;

        let conn = pool.get().context("opening sqlite connection")?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self { pool })
    }

    /// Initialize schema and run migrations
    fn init_schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            "#,
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(
                    (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                    0
                )",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::apply_schema_v1(conn)?;
        }

        Ok(())
    }

    fn apply_schema_v1(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                upstream_key TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deactivated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                project_id TEXT NOT NULL,
                expires_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                request_count INTEGER NOT NULL DEFAULT 0,
                max_requests INTEGER,
                cache_hit_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_used_at TEXT,

                FOREIGN KEY (project_id) REFERENCES projects(id)
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_project ON tokens(project_id);

            INSERT INTO metadata (key, value) VALUES ('schema_version', '1')
                ON CONFLICT(key) DO UPDATE SET value = '1';
            "#,
        )?;
        Ok(())
    }

    /// Run a closure against a pooled connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(anyhow::anyhow!(err))
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    raw.map(parse_ts).transpose()
}

fn parse_uuid(raw: String) -> Result<Uuid, rusqlite::Error> {
    raw.parse().map_err(|e: uuid::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn project_from_row(row: &Row<'_>) -> Result<Project, rusqlite::Error> {
    Ok(Project {
        id: parse_uuid(row.get(0)?)?,
        name: row.get(1)?,
        upstream_key: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        created_at: parse_ts(row.get(4)?)?,
        updated_at: parse_ts(row.get(5)?)?,
        deactivated_at: parse_opt_ts(row.get(6)?)?,
    })
}

fn token_from_row(row: &Row<'_>) -> Result<TokenRecord, rusqlite::Error> {
    Ok(TokenRecord {
        id: parse_uuid(row.get(0)?)?,
        token: row.get(1)?,
        project_id: parse_uuid(row.get(2)?)?,
        expires_at: parse_opt_ts(row.get(3)?)?,
        is_active: row.get::<_, i64>(4)? != 0,
        request_count: row.get::<_, i64>(5)? as u64,
        max_requests: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
        cache_hit_count: row.get::<_, i64>(7)? as u64,
        created_at: parse_ts(row.get(8)?)?,
        last_used_at: parse_opt_ts(row.get(9)?)?,
    })
}

const PROJECT_COLUMNS: &str =
    "id, name, upstream_key, is_active, created_at, updated_at, deactivated_at";
const TOKEN_COLUMNS: &str = "id, token, project_id, expires_at, is_active, request_count, \
     max_requests, cache_hit_count, created_at, last_used_at";

#[async_trait]
impl TokenStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn create_project(&self, project: Project) -> Result<Project, StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name, upstream_key, is_active, created_at, updated_at, deactivated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project.id.to_string(),
                    project.name,
                    project.upstream_key,
                    project.is_active as i64,
                    project.created_at.to_rfc3339(),
                    project.updated_at.to_rfc3339(),
                    project.deactivated_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(backend)?;
            Ok(project)
        })
        .await
    }

    async fn get_project(&self, id: Uuid) -> Result<Project, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id.to_string()],
                project_from_row,
            )
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::ProjectNotFound)
        })
        .await
    }

    async fn update_project(&self, id: Uuid, patch: ProjectPatch) -> Result<Project, StoreError> {
        self.call(move |conn| {
            let now = Utc::now();
            if let Some(name) = &patch.name {
                conn.execute(
                    "UPDATE projects SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![name, now.to_rfc3339(), id.to_string()],
                )
                .map_err(backend)?;
            }
            if let Some(key) = &patch.upstream_key {
                conn.execute(
                    "UPDATE projects SET upstream_key = ?1, updated_at = ?2 WHERE id = ?3",
                    params![key, now.to_rfc3339(), id.to_string()],
                )
                .map_err(backend)?;
            }
            if let Some(active) = patch.is_active {
                let deactivated_at = if active { None } else { Some(now.to_rfc3339()) };
                conn.execute(
                    "UPDATE projects SET is_active = ?1, deactivated_at = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![active as i64, deactivated_at, now.to_rfc3339(), id.to_string()],
                )
                .map_err(backend)?;
            }
            conn.query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id.to_string()],
                project_from_row,
            )
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::ProjectNotFound)
        })
        .await
    }

    async fn delete_project(&self, id: Uuid) -> Result<(), StoreError> {
        self.call(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "UPDATE projects SET is_active = 0, deactivated_at = ?1, updated_at = ?1
                     WHERE id = ?2",
                    params![now, id.to_string()],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::ProjectNotFound);
            }
            Ok(())
        })
        .await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map([], project_from_row)
                .map_err(backend)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;
            Ok(rows)
        })
        .await
    }

    async fn get_upstream_key(&self, project_id: Uuid) -> Result<String, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT upstream_key FROM projects WHERE id = ?1",
                params![project_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::ProjectNotFound)
        })
        .await
    }

    async fn is_project_active(&self, project_id: Uuid) -> Result<bool, StoreError> {
        self.call(move |conn| {
            let active: Option<i64> = conn
                .query_row(
                    "SELECT is_active FROM projects WHERE id = ?1",
                    params![project_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            Ok(active.map(|a| a != 0).unwrap_or(false))
        })
        .await
    }

    async fn create_token(&self, token: TokenRecord) -> Result<TokenRecord, StoreError> {
        self.call(move |conn| {
            let project_exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM projects WHERE id = ?1",
                    params![token.project_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            if project_exists.is_none() {
                return Err(StoreError::ProjectNotFound);
            }

            conn.execute(
                "INSERT INTO tokens (id, token, project_id, expires_at, is_active,
                                     request_count, max_requests, cache_hit_count,
                                     created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    token.id.to_string(),
                    token.token,
                    token.project_id.to_string(),
                    token.expires_at.map(|t| t.to_rfc3339()),
                    token.is_active as i64,
                    token.request_count as i64,
                    token.max_requests.map(|n| n as i64),
                    token.cache_hit_count as i64,
                    token.created_at.to_rfc3339(),
                    token.last_used_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(backend)?;
            Ok(token)
        })
        .await
    }

    async fn get_token(&self, id_or_token: &str) -> Result<TokenRecord, StoreError> {
        let key = id_or_token.to_string();
        self.call(move |conn| {
            let column = if key.parse::<Uuid>().is_ok() { "id" } else { "token" };
            conn.query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE {column} = ?1"),
                params![key],
                token_from_row,
            )
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::TokenNotFound)
        })
        .await
    }

    async fn list_tokens(&self, filter: TokenFilter) -> Result<Vec<TokenRecord>, StoreError> {
        self.call(move |conn| {
            let mut sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE 1=1");
            let mut args: Vec<String> = Vec::new();
            if let Some(project_id) = filter.project_id {
                sql.push_str(" AND project_id = ?");
                args.push(project_id.to_string());
            }
            if filter.active_only {
                sql.push_str(" AND is_active = 1");
            }
            sql.push_str(" ORDER BY created_at");

            let mut stmt = conn.prepare(&sql).map_err(backend)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), token_from_row)
                .map_err(backend)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;
            Ok(rows)
        })
        .await
    }

    async fn update_token(&self, id: Uuid, patch: TokenPatch) -> Result<TokenRecord, StoreError> {
        self.call(move |conn| {
            if let Some(active) = patch.is_active {
                conn.execute(
                    "UPDATE tokens SET is_active = ?1 WHERE id = ?2",
                    params![active as i64, id.to_string()],
                )
                .map_err(backend)?;
            }
            if let Some(max) = patch.max_requests {
                conn.execute(
                    "UPDATE tokens SET max_requests = ?1 WHERE id = ?2",
                    params![max as i64, id.to_string()],
                )
                .map_err(backend)?;
            }
            if let Some(expires_at) = patch.expires_at {
                conn.execute(
                    "UPDATE tokens SET expires_at = ?1 WHERE id = ?2",
                    params![expires_at.to_rfc3339(), id.to_string()],
                )
                .map_err(backend)?;
            }
            conn.query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1"),
                params![id.to_string()],
                token_from_row,
            )
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::TokenNotFound)
        })
        .await
    }

    async fn revoke_token(&self, id: Uuid) -> Result<TokenRecord, StoreError> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tokens SET is_active = 0 WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::TokenNotFound);
            }
            conn.query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1"),
                params![id.to_string()],
                token_from_row,
            )
            .map_err(backend)
        })
        .await
    }

    async fn increment_request_count(&self, token_id: Uuid, delta: u64) -> Result<(), StoreError> {
        self.call(move |conn| {
            // Delta update: retried or reordered flushes stay monotonic
            conn.execute(
                "UPDATE tokens SET request_count = request_count + ?1, last_used_at = ?2
                 WHERE id = ?3",
                params![delta as i64, Utc::now().to_rfc3339(), token_id.to_string()],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn increment_cache_hits(&self, token_id: Uuid, delta: u64) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE tokens SET cache_hit_count = cache_hit_count + ?1 WHERE id = ?2",
                params![delta as i64, token_id.to_string()],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn test_token(project_id: Uuid) -> TokenRecord {
        TokenRecord {
            id: Uuid::new_v4(),
            token: format!("wt_{}", Uuid::new_v4().simple()),
            project_id,
            expires_at: None,
            is_active: true,
            request_count: 0,
            max_requests: Some(2),
            cache_hit_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn ping_succeeds() {
        let (store, _dir) = open_store().await;
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn project_round_trip_preserves_fields() {
        let (store, _dir) = open_store().await;
        let created = store
            .create_project(Project::new("acme".into(), "sk-upstream".into()))
            .await
            .unwrap();
        let fetched = store.get_project(created.id).await.unwrap();
        assert_eq!(fetched.name, created.name);
        assert_eq!(fetched.upstream_key, "sk-upstream");
        assert!(fetched.is_active);
        assert!(fetched.deactivated_at.is_none());
    }

    #[tokio::test]
    async fn soft_delete_stamps_deactivation() {
        let (store, _dir) = open_store().await;
        let project = store
            .create_project(Project::new("acme".into(), "sk".into()))
            .await
            .unwrap();
        store.delete_project(project.id).await.unwrap();

        let fetched = store.get_project(project.id).await.unwrap();
        assert!(!fetched.is_active);
        assert!(fetched.deactivated_at.is_some());
        assert!(!store.is_project_active(project.id).await.unwrap());
    }

    #[tokio::test]
    async fn token_lifecycle_and_counters() {
        let (store, _dir) = open_store().await;
        let project = store
            .create_project(Project::new("acme".into(), "sk".into()))
            .await
            .unwrap();
        let token = store.create_token(test_token(project.id)).await.unwrap();

        store.increment_request_count(token.id, 1).await.unwrap();
        store.increment_request_count(token.id, 1).await.unwrap();
        store.increment_cache_hits(token.id, 3).await.unwrap();

        let fetched = store.get_token(&token.token).await.unwrap();
        assert_eq!(fetched.request_count, 2);
        assert_eq!(fetched.cache_hit_count, 3);
        assert!(fetched.last_used_at.is_some());

        let revoked = store.revoke_token(token.id).await.unwrap();
        assert!(!revoked.is_active);
        assert!(!store.get_token(&token.token).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn list_tokens_filters_by_project_and_active() {
        let (store, _dir) = open_store().await;
        let p1 = store
            .create_project(Project::new("one".into(), "sk1".into()))
            .await
            .unwrap();
        let p2 = store
            .create_project(Project::new("two".into(), "sk2".into()))
            .await
            .unwrap();
        let t1 = store.create_token(test_token(p1.id)).await.unwrap();
        let _t2 = store.create_token(test_token(p2.id)).await.unwrap();
        store.revoke_token(t1.id).await.unwrap();

        let all = store.list_tokens(TokenFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let p1_active = store
            .list_tokens(TokenFilter {
                project_id: Some(p1.id),
                active_only: true,
            })
            .await
            .unwrap();
        assert!(p1_active.is_empty());
    }

    #[tokio::test]
    async fn token_for_unknown_project_is_rejected() {
        let (store, _dir) = open_store().await;
        let result = store.create_token(test_token(Uuid::new_v4())).await;
        assert!(matches!(result, Err(StoreError::ProjectNotFound)));
    }

    #[tokio::test]
    async fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let project_id = {
            let store = SqliteStore::open(&path).unwrap();
            let project = store
                .create_project(Project::new("acme".into(), "sk".into()))
                .await
                .unwrap();
            project.id
        };

        let store = SqliteStore::open(&path).unwrap();
        let fetched = store.get_project(project_id).await.unwrap();
        assert_eq!(fetched.name, "acme");
    }
}
