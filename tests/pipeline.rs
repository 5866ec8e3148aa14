//! End-to-end pipeline tests
//!
//! The full application router runs against a local stub upstream; requests
//! are driven through the middleware chain with `tower::ServiceExt::oneshot`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, Response, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::util::ServiceExt;
use uuid::Uuid;

use tollbooth::auth::{ActiveProjectCache, TokenCache};
use tollbooth::bus;
use tollbooth::cache::HttpCache;
use tollbooth::config::{Config, StoreDriver};
use tollbooth::dispatcher::Dispatcher;
use tollbooth::proxy::{self, ProxyState};
use tollbooth::ratelimit;
use tollbooth::stats::StatsAggregator;
use tollbooth::store::MemoryStore;

const ADMIN_TOKEN: &str = "admin-secret";
const SSE_CHUNKS: usize = 40;
const SSE_CHUNK: &[u8] = b"data: {\"delta\":\"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\"}\n\n";

#[derive(Clone)]
struct UpstreamState {
    calls: Arc<AtomicUsize>,
}

async fn upstream_models(State(state): State<UpstreamState>) -> Response<Body> {
    state.calls.fetch_add(1, Ordering::SeqCst);
    Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CACHE_CONTROL, "max-age=60")
        .body(Body::from(r#"{"object":"list","data":[{"id":"gpt-4o"}]}"#))
        .unwrap()
}

async fn upstream_chat(State(state): State<UpstreamState>) -> Response<Body> {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let chunks = (0..SSE_CHUNKS).map(|_| Ok::<_, std::convert::Infallible>(Bytes::from_static(SSE_CHUNK)));
    Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "max-age=60")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}

async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = UpstreamState {
        calls: calls.clone(),
    };
    let app = Router::new()
        .route("/v1/models", get(upstream_models))
        .route("/v1/chat/completions", post(upstream_chat))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, calls)
}

struct Harness {
    app: Router,
    upstream_calls: Arc<AtomicUsize>,
}

impl Harness {
    async fn new(configure: impl FnOnce(&mut Config)) -> Self {
        let (upstream_addr, upstream_calls) = spawn_upstream().await;

        let mut config = Config::default();
        config.upstream_base_url = format!("http://{upstream_addr}");
        config.store.driver = StoreDriver::Memory;
        config.admin.token = Some(ADMIN_TOKEN.to_string());
        config.dispatcher.file_sink_path = None;
        config.dispatcher.workers = 1;
        // Deterministic tests: no validation caching, tiny counter batches
        config.token_cache.ttl = Duration::ZERO;
        config.project_cache.ttl = Duration::ZERO;
        config.cache.max_object_bytes = 1024;
        configure(&mut config);

        let store = Arc::new(MemoryStore::new());
        let token_cache = Arc::new(TokenCache::new(
            config.token_cache.capacity,
            config.token_cache.ttl,
        ));
        let project_cache = Arc::new(ActiveProjectCache::new(
            config.project_cache.capacity,
            config.project_cache.ttl,
        ));
        let rate_limiter = ratelimit::build(&config.rate_limit, None);
        let event_bus = bus::build(&config.bus, None);
        let dispatcher = Arc::new(
            Dispatcher::start(config.dispatcher.clone(), vec![], event_bus.as_ref()).await,
        );
        let stats = Arc::new(StatsAggregator::new(
            store.clone(),
            1,
            Duration::from_millis(10),
            1000,
        ));
        let cache_backend = HttpCache::build_backend(&config.cache, None);
        let http_cache = Arc::new(HttpCache::new(config.cache.clone(), cache_backend));
        let client = proxy::build_client(&config).unwrap();
        let allowlist = Arc::new(config.load_allowlist().unwrap());

        let state = ProxyState {
            client,
            config: Arc::new(config),
            allowlist,
            store,
            token_cache,
            project_cache,
            rate_limiter,
            http_cache,
            stats,
            bus: event_bus,
            dispatcher,
        };

        Self {
            app: proxy::build_app(state),
            upstream_calls,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn admin_json(&self, method: &str, path: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.send(request).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Create a project and a token through the management API; returns
    /// (project_id, token_id, full token string).
    async fn provision(&self, max_requests: Option<u64>) -> (Uuid, Uuid, String) {
        let (status, project) = self
            .admin_json(
                "POST",
                "/admin/projects",
                json!({"name": "acme", "upstream_key": "sk-upstream-key"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let project_id: Uuid = project["id"].as_str().unwrap().parse().unwrap();

        let (status, token) = self
            .admin_json(
                "POST",
                "/admin/tokens",
                json!({"project_id": project_id, "max_requests": max_requests}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let token_id: Uuid = token["id"].as_str().unwrap().parse().unwrap();
        let token_string = token["token"].as_str().unwrap().to_string();
        assert!(token_string.starts_with("wt_"), "full token returned once");
        (project_id, token_id, token_string)
    }

    fn proxy_get(&self, path: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }
}

async fn collect_body(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn token_allowance_enforced_across_requests() {
    let harness = Harness::new(|_| {}).await;
    let (_, token_id, token) = harness.provision(Some(2)).await;

    // Requests 1 and 2 pass; the usage counter follows each one
    for expected_count in 1..=2u64 {
        let response = harness.send(harness.proxy_get("/v1/models", &token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        settle().await;

        let (_, view) = harness
            .admin_json("GET", &format!("/admin/tokens/{token_id}"), json!({}))
            .await;
        assert_eq!(view["request_count"], expected_count);
    }

    // Request 3 is rejected: the allowance is exhausted
    let response = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&collect_body(response).await).unwrap();
    assert_eq!(body["code"], "token_exhausted");
}

#[tokio::test]
async fn exhausted_rejection_leaves_counter_unchanged() {
    let harness = Harness::new(|config| {
        config.cache.enabled = false;
    })
    .await;
    let (_, token_id, token) = harness.provision(Some(1)).await;

    assert_eq!(
        harness.send(harness.proxy_get("/v1/models", &token)).await.status(),
        StatusCode::OK
    );
    settle().await;

    for _ in 0..3 {
        assert_eq!(
            harness.send(harness.proxy_get("/v1/models", &token)).await.status(),
            StatusCode::UNAUTHORIZED
        );
    }
    settle().await;

    let (_, view) = harness
        .admin_json("GET", &format!("/admin/tokens/{token_id}"), json!({}))
        .await;
    assert_eq!(view["request_count"], 1, "rejected requests are not counted");
}

#[tokio::test]
async fn upstream_receives_project_key_not_withering_token() {
    // The stub upstream echoes nothing, so assert indirectly: a valid token
    // reaches the upstream (200) even though the upstream knows nothing
    // about withering tokens, which means Authorization was rewritten.
    let harness = Harness::new(|_| {}).await;
    let (_, _, token) = harness.provision(None).await;

    let response = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.upstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_hit_serves_identical_bytes_without_upstream_call() {
    let harness = Harness::new(|_| {}).await;
    let (_, _, token) = harness.provision(None).await;

    let first = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    let first_bytes = collect_body(first).await;
    settle().await; // cache write is async after the body settles

    let second = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    assert!(second.headers().get("x-cache-key").is_some());
    let second_bytes = collect_body(second).await;

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(
        harness.upstream_calls.load(Ordering::SeqCst),
        1,
        "hit never reached the upstream"
    );
}

#[tokio::test]
async fn streaming_over_cap_reaches_client_but_not_cache() {
    // SSE body is ~2.5 KB, cap is 1 KB
    let harness = Harness::new(|_| {}).await;
    let (_, _, token) = harness.provision(None).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CACHE_CONTROL, "public")
        .body(Body::from(r#"{"stream":true}"#))
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = collect_body(response).await;
    assert_eq!(
        bytes.len(),
        SSE_CHUNKS * SSE_CHUNK.len(),
        "client receives the full stream"
    );
    settle().await;

    // An equivalent request must miss: nothing was cached
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CACHE_CONTROL, "public")
        .body(Body::from(r#"{"stream":true}"#))
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(harness.upstream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn streaming_under_cap_is_captured_and_replayed() {
    let harness = Harness::new(|config| {
        config.cache.max_object_bytes = 16 * 1024;
    })
    .await;
    let (_, _, token) = harness.provision(None).await;

    let make_request = |token: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CACHE_CONTROL, "public")
            .body(Body::from(r#"{"stream":true}"#))
            .unwrap()
    };

    let first = harness.send(make_request(&token)).await;
    let first_bytes = collect_body(first).await;
    settle().await;

    let second = harness.send(make_request(&token)).await;
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    let second_bytes = collect_body(second).await;
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(harness.upstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn post_without_public_directive_bypasses_cache() {
    let harness = Harness::new(|_| {}).await;
    let (_, _, token) = harness.provision(None).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(r#"{"stream":true}"#))
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.headers().get("x-cache").unwrap(), "BYPASS");
}

#[tokio::test]
async fn revocation_takes_effect_immediately() {
    // Generous token-cache TTL: revocation must still bite because the admin
    // layer invalidates the cache entry synchronously
    let harness = Harness::new(|config| {
        config.token_cache.ttl = Duration::from_secs(600);
    })
    .await;
    let (_, token_id, token) = harness.provision(None).await;

    assert_eq!(
        harness.send(harness.proxy_get("/v1/models", &token)).await.status(),
        StatusCode::OK
    );

    let (status, _) = harness
        .admin_json("DELETE", &format!("/admin/tokens/{token_id}"), json!({}))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let response = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&collect_body(response).await).unwrap();
    assert_eq!(body["code"], "token_revoked");

    // Fetching the revoked token shows is_active=false
    let (status, view) = harness
        .admin_json("GET", &format!("/admin/tokens/{token_id}"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["is_active"], false);
    assert_ne!(view["token"].as_str().unwrap(), token, "token string obfuscated after creation");
}

#[tokio::test]
async fn project_deactivation_blocks_valid_tokens() {
    let harness = Harness::new(|_| {}).await;
    let (project_id, _, token) = harness.provision(None).await;

    assert_eq!(
        harness.send(harness.proxy_get("/v1/models", &token)).await.status(),
        StatusCode::OK
    );

    let (status, _) = harness
        .admin_json("DELETE", &format!("/admin/projects/{project_id}"), json!({}))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let response = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&collect_body(response).await).unwrap();
    assert_eq!(body["code"], "project_inactive");
}

#[tokio::test]
async fn missing_or_malformed_credentials_are_rejected() {
    let harness = Harness::new(|_| {}).await;
    harness.provision(None).await;

    let no_auth = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(no_auth).await.status(), StatusCode::UNAUTHORIZED);

    let malformed = harness.proxy_get("/v1/models", "sk-not-a-withering-token");
    let response = harness.send(malformed).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&collect_body(response).await).unwrap();
    assert_eq!(body["code"], "invalid_token_format");

    // Well-formed but unknown token
    let unknown = harness.proxy_get("/v1/models", &tollbooth::auth::generate_token_string());
    let response = harness.send(unknown).await;
    let body: Value = serde_json::from_slice(&collect_body(response).await).unwrap();
    assert_eq!(body["code"], "token_not_found");
}

#[tokio::test]
async fn allowlist_rejects_unknown_paths_and_methods() {
    let harness = Harness::new(|_| {}).await;
    let (_, _, token) = harness.provision(None).await;

    let response = harness.send(harness.proxy_get("/internal/admin", &token)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let wrong_method = Request::builder()
        .method("DELETE")
        .uri("/v1/models")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        harness.send(wrong_method).await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );
}

#[tokio::test]
async fn oversized_request_body_is_rejected() {
    let harness = Harness::new(|config| {
        config.max_request_size = 16;
    })
    .await;
    let (_, _, token) = harness.provision(None).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    assert_eq!(
        harness.send(request).await.status(),
        StatusCode::PAYLOAD_TOO_LARGE
    );
}

#[tokio::test]
async fn rate_limit_denies_with_retry_after() {
    let harness = Harness::new(|config| {
        config.rate_limit.max_requests = 1;
        config.cache.enabled = false;
    })
    .await;
    let (_, _, token) = harness.provision(None).await;

    assert_eq!(
        harness.send(harness.proxy_get("/v1/models", &token)).await.status(),
        StatusCode::OK
    );

    let denied = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = denied
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn request_id_minted_and_mirrored() {
    let harness = Harness::new(|_| {}).await;
    let (_, _, token) = harness.provision(None).await;

    let response = harness.send(harness.proxy_get("/v1/models", &token)).await;
    let minted = response.headers().get("x-request-id").unwrap();
    assert!(!minted.to_str().unwrap().is_empty());

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header("x-request-id", "client-supplied-id")
        .body(Body::empty())
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "client-supplied-id"
    );
}

#[tokio::test]
async fn cache_purge_forces_next_miss() {
    let harness = Harness::new(|_| {}).await;
    let (project_id, _, token) = harness.provision(None).await;

    harness.send(harness.proxy_get("/v1/models", &token)).await;
    settle().await;
    let hit = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(hit.headers().get("x-cache").unwrap(), "HIT");

    let (status, result) = harness
        .admin_json("POST", "/admin/cache/purge", json!({"project_id": project_id}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["removed"], 1);

    let miss = harness.send(harness.proxy_get("/v1/models", &token)).await;
    assert_eq!(miss.headers().get("x-cache").unwrap(), "MISS");
}

#[tokio::test]
async fn admin_requires_exact_bearer() {
    let harness = Harness::new(|_| {}).await;

    let request = Request::builder()
        .method("GET")
        .uri("/admin/projects")
        .header(header::AUTHORIZATION, "Bearer wrong-token")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("GET")
        .uri("/admin/projects")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_views_obfuscate_secrets() {
    let harness = Harness::new(|_| {}).await;
    let (project_id, _, _) = harness.provision(None).await;

    let (_, project) = harness
        .admin_json("GET", &format!("/admin/projects/{project_id}"), json!({}))
        .await;
    let shown = project["upstream_key"].as_str().unwrap();
    assert_ne!(shown, "sk-upstream-key");
    assert!(shown.contains("****"));
}

#[tokio::test]
async fn metrics_snapshot_exposes_component_counters() {
    let harness = Harness::new(|_| {}).await;
    let (_, _, token) = harness.provision(None).await;
    harness.send(harness.proxy_get("/v1/models", &token)).await;

    let (status, metrics) = harness.admin_json("GET", "/admin/metrics", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    for key in ["token_cache", "rate_limiter", "http_cache", "stats", "bus", "dispatcher"] {
        assert!(metrics.get(key).is_some(), "missing {key}");
    }
}

#[tokio::test]
async fn health_endpoints() {
    let harness = Harness::new(|_| {}).await;

    let live = harness
        .send(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(live.status(), StatusCode::OK);

    let ready = harness
        .send(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(ready.status(), StatusCode::OK);
}
