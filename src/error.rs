//! Request-pipeline error types and response mapping
//!
//! Every failure the middleware chain or proxy core can produce maps to a
//! stable machine-readable code and an HTTP status. Clients receive a minimal
//! JSON body `{code, description}`; internal detail (store errors, transport
//! errors) stays in the logs and never reaches the wire.

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Errors terminating a proxied request before or instead of an upstream response.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("authorization header missing or malformed")]
    InvalidTokenFormat,

    #[error("unknown token")]
    TokenNotFound,

    #[error("token has been revoked")]
    TokenRevoked,

    #[error("token has expired")]
    TokenExpired,

    #[error("token request allowance exhausted")]
    TokenExhausted,

    #[error("project is deactivated")]
    ProjectInactive,

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("path not allowed")]
    PathNotAllowed,

    #[error("method not allowed for this path")]
    MethodNotAllowed,

    #[error("request body too large")]
    RequestBodyTooLarge,

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream unavailable")]
    UpstreamUnavailable,

    #[error("storage error")]
    Store(anyhow::Error),

    #[error("internal error")]
    Internal(anyhow::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTokenFormat
            | ProxyError::TokenNotFound
            | ProxyError::TokenRevoked
            | ProxyError::TokenExpired
            | ProxyError::TokenExhausted => StatusCode::UNAUTHORIZED,
            ProxyError::ProjectInactive => StatusCode::FORBIDDEN,
            ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::PathNotAllowed => StatusCode::NOT_FOUND,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::RequestBodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyError::Store(_) | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::InvalidTokenFormat => "invalid_token_format",
            ProxyError::TokenNotFound => "token_not_found",
            ProxyError::TokenRevoked => "token_revoked",
            ProxyError::TokenExpired => "token_expired",
            ProxyError::TokenExhausted => "token_exhausted",
            ProxyError::ProjectInactive => "project_inactive",
            ProxyError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ProxyError::PathNotAllowed => "path_not_allowed",
            ProxyError::MethodNotAllowed => "method_not_allowed",
            ProxyError::RequestBodyTooLarge => "request_body_too_large",
            ProxyError::UpstreamTimeout => "upstream_timeout",
            ProxyError::UpstreamUnavailable => "upstream_unavailable",
            ProxyError::Store(_) => "storage_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// Map a reqwest transport failure to the matching gateway error.
    pub fn from_upstream(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout
        } else {
            ProxyError::UpstreamUnavailable
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();

        // Internal causes stay server-side; the client sees the stable code only.
        match &self {
            ProxyError::Store(source) | ProxyError::Internal(source) => {
                tracing::error!(code = self.code(), error = %source, "request failed");
            }
            other => {
                tracing::debug!(code = other.code(), "request rejected");
            }
        }

        let body = json!({
            "code": self.code(),
            "description": self.to_string(),
        });

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");

        if let ProxyError::RateLimitExceeded { retry_after_secs } = &self {
            builder = builder.header(header::RETRY_AFTER, retry_after_secs.to_string());
        }

        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| {
                Response::new(Body::from("{\"code\":\"internal_error\",\"description\":\"internal error\"}"))
            })
    }
}
