//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`--config` path or ~/.config/tollbooth/config.toml)
//! 3. Built-in defaults (lowest priority)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

mod allowlist;
mod file;

#[cfg(test)]
mod tests;

pub use allowlist::{AllowRule, Allowlist, RouteMatch};
pub use file::FileConfig;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub listen_addr: SocketAddr,

    /// Default upstream target, e.g. "https://api.openai.com"
    pub upstream_base_url: String,

    /// Per-request deadline for the upstream call
    pub request_timeout: Duration,

    /// Reject request bodies larger than this (bytes)
    pub max_request_size: usize,

    /// Also the cap for request/response bodies captured into events (bytes)
    pub event_body_cap: usize,

    /// Set X-Forwarded-For on upstream requests
    pub forward_client_ip: bool,

    /// Shared key-value log URL; enables distributed rate limiting, the
    /// durable bus backend, and the distributed cache backend
    pub redis_url: Option<String>,

    /// Provider allowlist file; falls back to the built-in OpenAI-compatible set
    pub allowlist_path: Option<PathBuf>,

    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub bus: BusConfig,
    pub dispatcher: DispatcherConfig,
    pub token_cache: TokenCacheConfig,
    pub project_cache: ProjectCacheConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            upstream_base_url: "https://api.openai.com".to_string(),
            request_timeout: Duration::from_secs(300),
            max_request_size: 10 * 1024 * 1024,
            event_body_cap: 64 * 1024,
            forward_client_ip: false,
            redis_url: None,
            allowlist_path: None,
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            bus: BusConfig::default(),
            dispatcher: DispatcherConfig::default(),
            token_cache: TokenCacheConfig::default(),
            project_cache: ProjectCacheConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Persistence backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// Process-local store, lost on restart; intended for development and tests
    Memory,
    /// SQLite database file
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub driver: StoreDriver,
    /// Database path for the sqlite driver
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: StoreDriver::Sqlite,
            path: PathBuf::from("./data/tollbooth.db"),
        }
    }
}

/// Behavior when the shared log is configured but unreachable and the
/// in-memory fallback is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterErrorPolicy {
    /// Let the request through and log a warning (default)
    Allow,
    /// Reject the request with 429
    Deny,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Fixed window length
    pub window: Duration,
    /// Requests allowed per token per window
    pub max_requests: u64,
    /// Shared-log key prefix
    pub key_prefix: String,
    /// Use the in-memory counter when the shared log is unreachable
    pub fallback_to_memory: bool,
    pub on_error: LimiterErrorPolicy,
    /// Server-side pepper for keyed token hashing in shared-log keys
    pub pepper: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 300,
            key_prefix: "tollbooth:rl".to_string(),
            fallback_to_memory: true,
            on_error: LimiterErrorPolicy::Allow,
            pepper: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackendKind,
    /// TTL when the upstream supplies no max-age/s-maxage
    pub default_ttl: Duration,
    /// Responses larger than this are never cached (bytes)
    pub max_object_bytes: usize,
    pub key_prefix: String,
    /// Entry bound for the in-memory backend
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            default_ttl: Duration::from_secs(300),
            max_object_bytes: 1024 * 1024,
            key_prefix: "tollbooth:cache".to_string(),
            max_entries: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub backend: BusBackendKind,
    /// Per-subscriber channel capacity; overflow drops the newest event
    pub buffer_size: usize,
    /// List key for the redis backend
    pub redis_key: String,
    /// Cap on the redis list; older entries are trimmed away
    pub redis_max_len: usize,
    /// Expiry on the redis list, refreshed on publish
    pub redis_ttl: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackendKind::Memory,
            buffer_size: 1000,
            redis_key: "tollbooth:events".to_string(),
            redis_max_len: 10_000,
            redis_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub url: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Events per batch
    pub batch_size: usize,
    /// Flush a partial batch after this long
    pub flush_interval: Duration,
    /// Concurrent batch workers
    pub workers: usize,
    /// Retries for transiently failing sinks
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_backoff: Duration,
    /// Drain deadline on shutdown
    pub drain_timeout: Duration,
    /// JSON-Lines event file; None disables the file sink
    pub file_sink_path: Option<PathBuf>,
    /// HTTP backends receiving event batches
    pub http_sinks: Vec<HttpSinkConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            workers: 2,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(5),
            file_sink_path: Some(PathBuf::from("./data/events.jsonl")),
            http_sinks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for ProjectCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    /// Management bearer token, compared exact-match; None disables /admin
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset, e.g. "info"
    pub level: String,
    /// Emit JSON log lines instead of human-readable output
    pub json: bool,
    /// Also append logs to this file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the config file, then env overrides.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = Config::default();

        let file_path = path
            .map(PathBuf::from)
            .or_else(Self::default_config_path)
            .filter(|p| p.exists());

        if let Some(file_path) = file_path {
            let raw = std::fs::read_to_string(&file_path)?;
            let file: FileConfig = toml::from_str(&raw)?;
            file.apply(&mut config);
            tracing::debug!("Loaded config from {}", file_path.display());
        }

        config.apply_env();
        Ok(config)
    }

    fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tollbooth").join("config.toml"))
    }

    /// Environment overrides for the settings that vary between deployments.
    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("TOLLBOOTH_LISTEN") {
            if let Ok(parsed) = addr.parse() {
                self.listen_addr = parsed;
            } else {
                tracing::warn!("Ignoring invalid TOLLBOOTH_LISTEN={addr}");
            }
        }
        if let Ok(url) = std::env::var("TOLLBOOTH_UPSTREAM_URL") {
            self.upstream_base_url = url;
        }
        if let Ok(url) = std::env::var("TOLLBOOTH_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Ok(token) = std::env::var("TOLLBOOTH_ADMIN_TOKEN") {
            self.admin.token = Some(token);
        }
        if let Ok(path) = std::env::var("TOLLBOOTH_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Ok(pepper) = std::env::var("TOLLBOOTH_RATE_LIMIT_PEPPER") {
            self.rate_limit.pepper = Some(pepper);
        }
    }

    /// Load the provider allowlist, falling back to the built-in set.
    pub fn load_allowlist(&self) -> anyhow::Result<Allowlist> {
        match &self.allowlist_path {
            Some(path) => Allowlist::from_file(path),
            None => Ok(Allowlist::builtin()),
        }
    }
}
