//! Event transport between the request pipeline and the dispatcher
//!
//! Two implementations behind one trait: an in-process bus with a bounded
//! channel per subscriber, and a shared-log bus on a capped redis list for
//! deployments where the dispatcher may run elsewhere. Publishing never
//! blocks the request path: full buffers drop the newest event and bump a
//! counter.

use async_trait::async_trait;
use tokio::sync::mpsc;

mod memory;
mod redis;

pub use memory::InProcessBus;
pub use redis::RedisBus;

use crate::config::{BusBackendKind, BusConfig};
use crate::events::ProxyEvent;
use std::sync::Arc;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusMetrics {
    pub published: u64,
    pub dropped: u64,
}

/// Publish/subscribe transport. Per publisher, delivery is FIFO; across
/// publishers ordering is undefined. Delivery is best-effort.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Enqueue an event; drops (with a counter) instead of blocking when
    /// buffers are full or the bus is closed.
    async fn publish(&self, event: ProxyEvent);

    /// Open a subscription receiving events published from now on.
    async fn subscribe(&self) -> mpsc::Receiver<ProxyEvent>;

    /// Stop delivery. Outstanding publishes return promptly; subscriber
    /// channels end.
    async fn close(&self);

    fn metrics(&self) -> BusMetrics;
}

/// Construct the configured bus backend.
pub fn build(
    config: &BusConfig,
    redis: Option<::redis::aio::ConnectionManager>,
) -> Arc<dyn EventBus> {
    match (config.backend, redis) {
        (BusBackendKind::Redis, Some(conn)) => Arc::new(RedisBus::new(config.clone(), conn)),
        (BusBackendKind::Redis, None) => {
            tracing::warn!("Bus backend 'redis' configured without redis_url, using in-process bus");
            Arc::new(InProcessBus::new(config.buffer_size))
        }
        (BusBackendKind::Memory, _) => Arc::new(InProcessBus::new(config.buffer_size)),
    }
}
