// Events that flow from the proxy to the dispatcher and its sinks
//
// One event describes one proxied exchange. Events are created by the
// instrumentation middleware after response headers have been flushed and
// are immutable once published on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A completed (or terminated) proxied exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEvent {
    /// Correlation id, mirrored on the client response
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    /// Owning project; absent when the request failed before validation
    pub project_id: Option<Uuid>,
    /// Obfuscated withering token; never the full credential
    pub token: Option<String>,
    /// Response headers minus hop-by-hop
    pub response_headers: Vec<(String, String)>,
    /// Request body up to the capture cap, lossily decoded
    pub request_body: Option<String>,
    /// Response body up to the capture cap, lossily decoded; None when the
    /// cap was exceeded or the body was not capturable
    pub response_body: Option<String>,
}

impl ProxyEvent {
    /// Compact summary for log lines.
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} {}ms",
            self.method, self.path, self.status, self.duration_ms
        )
    }
}
