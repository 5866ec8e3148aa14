//! Config file structure (deserialization layer)
//!
//! Every field is optional; absent fields keep their defaults. The shapes
//! mirror the runtime `Config` sections but stay independent so the file
//! format can evolve without touching runtime types.

use std::path::PathBuf;

use serde::Deserialize;

use super::{
    BusBackendKind, CacheBackendKind, Config, HttpSinkConfig, LimiterErrorPolicy, StoreDriver,
};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_addr: Option<String>,
    pub upstream_base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub max_request_size: Option<usize>,
    pub event_body_cap: Option<usize>,
    pub forward_client_ip: Option<bool>,
    pub redis_url: Option<String>,
    pub allowlist_path: Option<PathBuf>,
    #[serde(default)]
    pub store: FileStore,
    #[serde(default)]
    pub rate_limit: FileRateLimit,
    #[serde(default)]
    pub cache: FileCache,
    #[serde(default)]
    pub bus: FileBus,
    #[serde(default)]
    pub dispatcher: FileDispatcher,
    #[serde(default)]
    pub token_cache: FileTokenCache,
    #[serde(default)]
    pub project_cache: FileProjectCache,
    #[serde(default)]
    pub admin: FileAdmin,
    #[serde(default)]
    pub logging: FileLogging,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileStore {
    pub driver: Option<StoreDriver>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRateLimit {
    pub enabled: Option<bool>,
    pub window_secs: Option<u64>,
    pub max_requests: Option<u64>,
    pub key_prefix: Option<String>,
    pub fallback_to_memory: Option<bool>,
    pub on_error: Option<LimiterErrorPolicy>,
    pub pepper: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileCache {
    pub enabled: Option<bool>,
    pub backend: Option<CacheBackendKind>,
    pub default_ttl_secs: Option<u64>,
    pub max_object_bytes: Option<usize>,
    pub key_prefix: Option<String>,
    pub max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileBus {
    pub backend: Option<BusBackendKind>,
    pub buffer_size: Option<usize>,
    pub redis_key: Option<String>,
    pub redis_max_len: Option<usize>,
    pub redis_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileHttpSink {
    pub url: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDispatcher {
    pub batch_size: Option<usize>,
    pub flush_interval_secs: Option<u64>,
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
    pub file_sink_path: Option<PathBuf>,
    pub file_sink_enabled: Option<bool>,
    #[serde(default)]
    pub http_sinks: Vec<FileHttpSink>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTokenCache {
    pub capacity: Option<usize>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileProjectCache {
    pub capacity: Option<usize>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileAdmin {
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileLogging {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub file: Option<PathBuf>,
}

macro_rules! overlay {
    ($target:expr, $source:expr) => {
        if let Some(value) = $source {
            $target = value;
        }
    };
}

impl FileConfig {
    /// Overlay file values onto the defaults.
    pub fn apply(self, config: &mut Config) {
        use std::time::Duration;

        if let Some(addr) = self.listen_addr {
            match addr.parse() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!("Ignoring invalid listen_addr {addr:?} in config file"),
            }
        }
        overlay!(config.upstream_base_url, self.upstream_base_url);
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        overlay!(config.max_request_size, self.max_request_size);
        overlay!(config.event_body_cap, self.event_body_cap);
        overlay!(config.forward_client_ip, self.forward_client_ip);
        if self.redis_url.is_some() {
            config.redis_url = self.redis_url;
        }
        if self.allowlist_path.is_some() {
            config.allowlist_path = self.allowlist_path;
        }

        overlay!(config.store.driver, self.store.driver);
        overlay!(config.store.path, self.store.path);

        overlay!(config.rate_limit.enabled, self.rate_limit.enabled);
        if let Some(secs) = self.rate_limit.window_secs {
            config.rate_limit.window = Duration::from_secs(secs);
        }
        overlay!(config.rate_limit.max_requests, self.rate_limit.max_requests);
        overlay!(config.rate_limit.key_prefix, self.rate_limit.key_prefix);
        overlay!(
            config.rate_limit.fallback_to_memory,
            self.rate_limit.fallback_to_memory
        );
        overlay!(config.rate_limit.on_error, self.rate_limit.on_error);
        if self.rate_limit.pepper.is_some() {
            config.rate_limit.pepper = self.rate_limit.pepper;
        }

        overlay!(config.cache.enabled, self.cache.enabled);
        overlay!(config.cache.backend, self.cache.backend);
        if let Some(secs) = self.cache.default_ttl_secs {
            config.cache.default_ttl = Duration::from_secs(secs);
        }
        overlay!(config.cache.max_object_bytes, self.cache.max_object_bytes);
        overlay!(config.cache.key_prefix, self.cache.key_prefix);
        overlay!(config.cache.max_entries, self.cache.max_entries);

        overlay!(config.bus.backend, self.bus.backend);
        overlay!(config.bus.buffer_size, self.bus.buffer_size);
        overlay!(config.bus.redis_key, self.bus.redis_key);
        overlay!(config.bus.redis_max_len, self.bus.redis_max_len);
        if let Some(secs) = self.bus.redis_ttl_secs {
            config.bus.redis_ttl = Duration::from_secs(secs);
        }

        overlay!(config.dispatcher.batch_size, self.dispatcher.batch_size);
        if let Some(secs) = self.dispatcher.flush_interval_secs {
            config.dispatcher.flush_interval = Duration::from_secs(secs);
        }
        overlay!(config.dispatcher.workers, self.dispatcher.workers);
        overlay!(config.dispatcher.max_retries, self.dispatcher.max_retries);
        if let Some(ms) = self.dispatcher.retry_backoff_ms {
            config.dispatcher.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = self.dispatcher.drain_timeout_secs {
            config.dispatcher.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = self.dispatcher.file_sink_path {
            config.dispatcher.file_sink_path = Some(path);
        }
        if self.dispatcher.file_sink_enabled == Some(false) {
            config.dispatcher.file_sink_path = None;
        }
        config.dispatcher.http_sinks = self
            .dispatcher
            .http_sinks
            .into_iter()
            .map(|s| HttpSinkConfig {
                url: s.url,
                bearer_token: s.bearer_token,
            })
            .collect();

        overlay!(config.token_cache.capacity, self.token_cache.capacity);
        if let Some(secs) = self.token_cache.ttl_secs {
            config.token_cache.ttl = Duration::from_secs(secs);
        }
        overlay!(config.project_cache.capacity, self.project_cache.capacity);
        if let Some(secs) = self.project_cache.ttl_secs {
            config.project_cache.ttl = Duration::from_secs(secs);
        }

        if self.admin.token.is_some() {
            config.admin.token = self.admin.token;
        }

        overlay!(config.logging.level, self.logging.level);
        overlay!(config.logging.json, self.logging.json);
        if self.logging.file.is_some() {
            config.logging.file = self.logging.file;
        }
    }
}
