//! Dispatcher sink contract
//!
//! A sink accepts batches of events. Failures are classified so the
//! dispatcher knows whether retrying can help.

use async_trait::async_trait;

use crate::events::ProxyEvent;

/// Classified delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Retrying cannot succeed (bad config, rejected payload). The batch is
    /// dropped immediately.
    #[error("permanent sink failure: {0}")]
    Permanent(#[source] anyhow::Error),
    /// Worth retrying with backoff (network, overload, timeouts).
    #[error("transient sink failure: {0}")]
    Transient(#[source] anyhow::Error),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver one batch. Must not retry internally; the dispatcher owns
    /// retry policy.
    async fn send(&self, batch: &[ProxyEvent]) -> Result<(), SinkError>;

    /// Flush and release resources on shutdown.
    async fn close(&self) {}
}
