//! The middleware chain
//!
//! Strictly ordered, outermost first: request-id, instrumentation, token
//! validation, project guard, rate limiting, HTTP cache, then the proxy
//! handler. The cache sits after validation because its key embeds the
//! validated project id. Each middleware terminates the request on its own
//! failure; cancellation propagates naturally because dropping the request
//! future drops every layer. The upstream deadline itself is bound into the
//! pooled client (see `start_proxy`).

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

use super::director::is_hop_by_hop;
use super::state::{BufferedBody, ProxyState, RequestId};
use super::streaming::CaptureStream;
use crate::auth::{self, AuthContext};
use crate::cache::{CachedResponse, HttpCache};
use crate::error::ProxyError;
use crate::events::ProxyEvent;
use crate::store::{StoreError, TokenValidity};
use crate::util::truncate_utf8_safe;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");

/// 1. Request-ID: accept a non-empty inbound correlation id, otherwise mint a
/// time-ordered one; stash it in extensions and mirror it on the response.
pub async fn request_id(mut req: Request, next: Next) -> Response<Body> {
    let inbound = [&X_REQUEST_ID, &X_CORRELATION_ID]
        .iter()
        .filter_map(|name| req.headers().get(*name))
        .filter_map(|value| value.to_str().ok())
        .find(|value| !value.is_empty())
        .map(str::to_string);

    let id = inbound.unwrap_or_else(|| Uuid::now_v7().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// 2. Instrumentation: buffer the request body (rejecting oversized ones),
/// measure duration, tee the response body up to the event cap, and publish
/// the exchange event once the last byte has gone out.
pub async fn instrumentation(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Response<Body> {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, state.config.max_request_size).await {
        Ok(bytes) => bytes,
        Err(_) => return ProxyError::RequestBodyTooLarge.into_response(),
    };

    let event_request_body = if body_bytes.is_empty() {
        None
    } else {
        let text = String::from_utf8_lossy(&body_bytes);
        Some(truncate_utf8_safe(&text, state.config.event_body_cap).to_string())
    };

    let mut req = Request::from_parts(parts, Body::from(body_bytes.clone()));
    req.extensions_mut().insert(BufferedBody(body_bytes));

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let auth = response.extensions().get::<AuthContext>().cloned();
    let response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let bus = state.bus.clone();
    let event_cap = state.config.event_body_cap;
    let (parts, body) = response.into_parts();
    let tee = CaptureStream::new(body.into_data_stream(), event_cap, move |captured| {
        let event = ProxyEvent {
            request_id,
            timestamp: Utc::now(),
            method,
            path,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            project_id: auth.as_ref().map(|a| a.project_id),
            token: auth.as_ref().map(|a| a.token_display()),
            response_headers,
            request_body: event_request_body,
            response_body: captured
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string()),
        };
        // Off the request path: the bus drops rather than blocks anyway
        tokio::spawn(async move { bus.publish(event).await });
    });

    Response::from_parts(parts, Body::from_stream(tee))
}

/// 4. Token validation: bearer extraction, cache lookup, store fallback,
/// expiry/activity/allowance checks. On success the auth context rides the
/// request extensions inward and the response extensions back outward.
pub async fn token_validation(
    State(state): State<ProxyState>,
    mut req: Request,
    next: Next,
) -> Response<Body> {
    let token = match bearer_token(req.headers()) {
        Some(token) => token,
        None => return ProxyError::InvalidTokenFormat.into_response(),
    };
    if !auth::is_well_formed(&token) {
        return ProxyError::InvalidTokenFormat.into_response();
    }

    let ctx = match state.token_cache.lookup(&token) {
        Some(cached) => {
            // Re-check token expiry on every cache hit
            if let Some(expires_at) = cached.expires_at {
                if Utc::now() >= expires_at {
                    return ProxyError::TokenExpired.into_response();
                }
            }
            AuthContext {
                token_id: cached.token_id,
                project_id: cached.project_id,
                token,
                expires_at: cached.expires_at,
            }
        }
        None => match state.store.get_token(&token).await {
            Ok(record) => match record.validity(Utc::now()) {
                TokenValidity::Valid => {
                    state.token_cache.store(
                        token.clone(),
                        record.id,
                        record.project_id,
                        record.expires_at,
                    );
                    AuthContext {
                        token_id: record.id,
                        project_id: record.project_id,
                        token,
                        expires_at: record.expires_at,
                    }
                }
                TokenValidity::Revoked => return ProxyError::TokenRevoked.into_response(),
                TokenValidity::Expired => return ProxyError::TokenExpired.into_response(),
                TokenValidity::Exhausted => return ProxyError::TokenExhausted.into_response(),
            },
            Err(StoreError::TokenNotFound) => return ProxyError::TokenNotFound.into_response(),
            Err(err) => return ProxyError::Store(err.into()).into_response(),
        },
    };

    req.extensions_mut().insert(ctx.clone());
    let mut response = next.run(req).await;
    // Outward for the instrumentation layer
    response.extensions_mut().insert(ctx);
    response
}

/// 5. Project guard: memoized active check; inactive tenants get 403.
pub async fn project_guard(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Response<Body> {
    let Some(ctx) = req.extensions().get::<AuthContext>().cloned() else {
        return ProxyError::Internal(anyhow::anyhow!("auth context missing")).into_response();
    };

    let active = match state.project_cache.get(ctx.project_id) {
        Some(active) => active,
        None => match state.store.is_project_active(ctx.project_id).await {
            Ok(active) => {
                state.project_cache.insert(ctx.project_id, active);
                active
            }
            Err(err) => return ProxyError::Store(err.into()).into_response(),
        },
    };

    if !active {
        return ProxyError::ProjectInactive.into_response();
    }
    next.run(req).await
}

/// 6. Rate limiter: deny over-limit tokens with Retry-After. A request that
/// clears every admission check counts against the token's usage here, so
/// cache hits and upstream calls are counted alike.
pub async fn rate_limit(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Response<Body> {
    let Some(ctx) = req.extensions().get::<AuthContext>().cloned() else {
        return ProxyError::Internal(anyhow::anyhow!("auth context missing")).into_response();
    };

    if state.config.rate_limit.enabled {
        let decision = state.rate_limiter.allow(&ctx.token).await;
        if !decision.allowed {
            return ProxyError::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs(),
            }
            .into_response();
        }
    }

    state.stats.record_request(ctx.token_id);
    next.run(req).await
}

/// 3(→7). HTTP cache: serve fresh entries, otherwise forward and capture the
/// response for the next equivalent request.
pub async fn http_cache(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Response<Body> {
    let Some(ctx) = req.extensions().get::<AuthContext>().cloned() else {
        return ProxyError::Internal(anyhow::anyhow!("auth context missing")).into_response();
    };

    let method = req.method().clone();
    if !state.http_cache.request_cacheable(&method, req.headers()) {
        let mut response = next.run(req).await;
        set_cache_header(&mut response, "BYPASS", None);
        return response;
    }

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let body = req
        .extensions()
        .get::<BufferedBody>()
        .map(|b| b.0.clone())
        .unwrap_or_default();

    let key = state
        .http_cache
        .derive_key(ctx.project_id, &method, &path, &query, req.headers(), &body);

    if let Some(entry) = state.http_cache.lookup(&key).await {
        state.stats.record_cache_hit(ctx.token_id);
        return response_from_cache(&key, entry);
    }

    // Single-flight: collapse concurrent buffered misses for this key.
    let flight = state.http_cache.begin_flight(&key).await;
    if let Some(entry) = state.http_cache.lookup(&key).await {
        state.stats.record_cache_hit(ctx.token_id);
        return response_from_cache(&key, entry);
    }

    let response = next.run(req).await;
    let status = response.status().as_u16();

    if !state.http_cache.response_cacheable(status, response.headers()) {
        let mut response = response;
        set_cache_header(&mut response, "MISS", Some(&key));
        return response;
    }

    let streaming = super::director::is_streaming_response(response.headers());
    let response_headers = response.headers().clone();
    let cache = state.http_cache.clone();
    let store_key = key.clone();

    // A streaming miss must not hold the per-key guard for the lifetime of
    // the stream; concurrent streaming misses proceed independently and the
    // last writer wins.
    let mut flight = Some(flight);
    if streaming {
        flight.take();
    }

    let (parts, body) = response.into_parts();
    let tee = CaptureStream::new(
        body.into_data_stream(),
        cache.max_object_bytes(),
        move |captured| {
            let _flight = flight; // released once the capture settles
            match captured {
                Some(bytes) => {
                    tokio::spawn(async move {
                        cache.store(&store_key, status, &response_headers, bytes).await;
                    });
                }
                None => cache.record_capture_overflow(),
            }
        },
    );

    let mut response = Response::from_parts(parts, Body::from_stream(tee));
    set_cache_header(&mut response, "MISS", Some(&key));
    response
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn set_cache_header(response: &mut Response<Body>, status: &'static str, key: Option<&str>) {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(status));
    if let Some(key) = key {
        if let Ok(value) = HeaderValue::from_str(&HttpCache::key_display(key)) {
            response.headers_mut().insert(X_CACHE_KEY, value);
        }
    }
}

fn response_from_cache(key: &str, entry: CachedResponse) -> Response<Body> {
    let mut builder = Response::builder().status(entry.status);
    for (name, value) in &entry.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let mut response = builder
        .body(Body::from(entry.body.clone()))
        .unwrap_or_else(|_| {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        });
    set_cache_header(&mut response, "HIT", Some(key));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use bytes::Bytes;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wt_abcdef"),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("wt_abcdef"));
    }

    #[test]
    fn cached_response_carries_hit_marker() {
        let entry = CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from_static(b"{}"),
            stored_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };
        let response = response_from_cache("tollbooth:cache:p:abc", entry);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(X_CACHE).unwrap(), "HIT");
        assert!(response.headers().get(X_CACHE_KEY).is_some());
    }
}
