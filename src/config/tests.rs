//! Configuration loading tests

use super::*;

#[test]
fn defaults_are_sane() {
    let config = Config::default();
    assert_eq!(config.listen_addr.port(), 8080);
    assert!(config.upstream_base_url.starts_with("https://"));
    assert_eq!(config.cache.max_object_bytes, 1024 * 1024);
    assert!(config.rate_limit.enabled);
    assert_eq!(config.rate_limit.on_error, LimiterErrorPolicy::Allow);
    assert!(config.admin.token.is_none());
}

#[test]
fn file_overlay_keeps_unset_defaults() {
    let file: FileConfig = toml::from_str(
        r#"
        upstream_base_url = "https://llm.internal"

        [cache]
        max_object_bytes = 2048
        "#,
    )
    .unwrap();

    let mut config = Config::default();
    file.apply(&mut config);

    assert_eq!(config.upstream_base_url, "https://llm.internal");
    assert_eq!(config.cache.max_object_bytes, 2048);
    // Untouched sections keep defaults
    assert_eq!(config.listen_addr.port(), 8080);
    assert_eq!(config.dispatcher.batch_size, 100);
}

#[test]
fn file_overlay_full_sections() {
    let file: FileConfig = toml::from_str(
        r#"
        listen_addr = "0.0.0.0:9000"
        redis_url = "redis://localhost:6379"
        request_timeout_secs = 30

        [store]
        driver = "memory"

        [rate_limit]
        window_secs = 10
        max_requests = 5
        on_error = "deny"

        [bus]
        backend = "redis"
        buffer_size = 64

        [dispatcher]
        batch_size = 10
        workers = 4
        file_sink_enabled = false

        [[dispatcher.http_sinks]]
        url = "https://events.example/ingest"
        bearer_token = "sink-secret"

        [token_cache]
        capacity = 128
        ttl_secs = 5

        [admin]
        token = "admin-secret"
        "#,
    )
    .unwrap();

    let mut config = Config::default();
    file.apply(&mut config);

    assert_eq!(config.listen_addr.port(), 9000);
    assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
    assert_eq!(config.request_timeout, std::time::Duration::from_secs(30));
    assert_eq!(config.store.driver, StoreDriver::Memory);
    assert_eq!(config.rate_limit.max_requests, 5);
    assert_eq!(config.rate_limit.on_error, LimiterErrorPolicy::Deny);
    assert_eq!(config.bus.backend, BusBackendKind::Redis);
    assert_eq!(config.dispatcher.workers, 4);
    assert!(config.dispatcher.file_sink_path.is_none());
    assert_eq!(config.dispatcher.http_sinks.len(), 1);
    assert_eq!(config.dispatcher.http_sinks[0].url, "https://events.example/ingest");
    assert_eq!(config.token_cache.capacity, 128);
    assert_eq!(config.admin.token.as_deref(), Some("admin-secret"));
}

#[test]
fn unknown_fields_are_rejected() {
    let result: Result<FileConfig, _> = toml::from_str("does_not_exist = 1");
    assert!(result.is_err());
}
