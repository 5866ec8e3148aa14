//! Shared-log event bus
//!
//! Publishers LPUSH serialized events onto a capped redis list; subscribers
//! BRPOP in a poll loop, so list order is preserved end to end. Subscribers
//! are competing consumers: each event is delivered to exactly one of them.
//! The list carries a TTL and a max length; if the dispatcher lags longer
//! than TTL or further than the cap, events are lost. That trade-off is
//! inherent to the transport and documented rather than prevented.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{BusMetrics, EventBus};
use crate::config::BusConfig;
use crate::events::ProxyEvent;

/// BRPOP wait per poll iteration; bounds close() latency.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RedisBus {
    config: BusConfig,
    conn: ConnectionManager,
    published: AtomicU64,
    dropped: AtomicU64,
    closed: Arc<AtomicBool>,
    poll_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisBus {
    pub fn new(config: BusConfig, conn: ConnectionManager) -> Self {
        Self {
            config,
            conn,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            poll_tasks: Mutex::new(Vec::new()),
        }
    }

    async fn append(&self, payload: String) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let key = &self.config.redis_key;
        let _: i64 = conn.lpush(key, payload).await?;
        let _: () = conn
            .ltrim(key, 0, self.config.redis_max_len as isize - 1)
            .await?;
        let _: i64 = conn
            .expire(key, self.config.redis_ttl.as_secs() as i64)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, event: ProxyEvent) {
        if self.closed.load(Ordering::Relaxed) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "Event serialization failed");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match self.append(payload).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "Shared-log publish failed, event dropped");
            }
        }
    }

    async fn subscribe(&self) -> mpsc::Receiver<ProxyEvent> {
        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        let mut conn = self.conn.clone();
        let key = self.config.redis_key.clone();
        let closed = Arc::clone(&self.closed);

        let handle = tokio::spawn(async move {
            while !closed.load(Ordering::Relaxed) {
                let popped: redis::RedisResult<Option<(String, String)>> = conn
                    .brpop(&key, POLL_TIMEOUT.as_secs_f64())
                    .await;
                match popped {
                    Ok(Some((_, payload))) => {
                        match serde_json::from_str::<ProxyEvent>(&payload) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    break; // subscriber gone
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "Discarding undecodable event");
                            }
                        }
                    }
                    Ok(None) => {} // poll timeout, re-check closed flag
                    Err(err) => {
                        tracing::warn!(error = %err, "Shared-log poll failed, backing off");
                        tokio::time::sleep(POLL_TIMEOUT).await;
                    }
                }
            }
        });
        self.poll_tasks.lock().await.push(handle);
        rx
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let mut tasks = self.poll_tasks.lock().await;
        for task in tasks.drain(..) {
            // Poll loops observe the flag within one BRPOP timeout
            if tokio::time::timeout(POLL_TIMEOUT * 2, task).await.is_err() {
                tracing::warn!("Shared-log poll task did not stop in time");
            }
        }
    }

    fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
