//! Usage and cache-hit counter aggregation
//!
//! High-cardinality per-token counters funnel through a bounded channel into
//! a background task that coalesces deltas per key and flushes them to the
//! store in batches. The hot path never blocks: when the channel is full the
//! increment is dropped and counted. Deltas lost to store errors are counted
//! the same way, so `recorded == flushed + dropped` holds after a final flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::store::TokenStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    Request,
    CacheHit,
}

enum Command {
    Record {
        token_id: Uuid,
        kind: StatKind,
        delta: u64,
    },
    Shutdown,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatsMetrics {
    /// Increments accepted into the channel
    pub recorded: u64,
    /// Increments dropped on a full channel or failed flush
    pub dropped: u64,
    /// Deltas successfully delivered to the store
    pub flushed: u64,
    /// Flush attempts that errored
    pub flush_failures: u64,
}

pub struct StatsAggregator {
    tx: mpsc::Sender<Command>,
    recorded: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    flushed: Arc<AtomicU64>,
    flush_failures: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatsAggregator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        batch_size: usize,
        flush_interval: Duration,
        channel_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let recorded = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let flushed = Arc::new(AtomicU64::new(0));
        let flush_failures = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(Self::run(
            store,
            rx,
            batch_size.max(1),
            flush_interval,
            Arc::clone(&dropped),
            Arc::clone(&flushed),
            Arc::clone(&flush_failures),
        ));

        Self {
            tx,
            recorded,
            dropped,
            flushed,
            flush_failures,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Non-blocking increment; drops under overload rather than stalling
    /// the request path.
    pub fn record(&self, token_id: Uuid, kind: StatKind) {
        match self.tx.try_send(Command::Record {
            token_id,
            kind,
            delta: 1,
        }) {
            Ok(()) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    dropped = self.dropped.load(Ordering::Relaxed),
                    "Stats backpressure: dropped increment"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Stats aggregator channel closed");
            }
        }
    }

    pub fn record_request(&self, token_id: Uuid) {
        self.record(token_id, StatKind::Request);
    }

    pub fn record_cache_hit(&self, token_id: Uuid) {
        self.record(token_id, StatKind::CacheHit);
    }

    /// Final flush with a deadline; called once during shutdown.
    pub async fn shutdown(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, self.tx.send(Command::Shutdown)).await;
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                tracing::warn!("Stats aggregator did not flush within {deadline:?}");
            }
        }
    }

    pub fn metrics(&self) -> StatsMetrics {
        StatsMetrics {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }

    async fn run(
        store: Arc<dyn TokenStore>,
        mut rx: mpsc::Receiver<Command>,
        batch_size: usize,
        flush_interval: Duration,
        dropped: Arc<AtomicU64>,
        flushed: Arc<AtomicU64>,
        flush_failures: Arc<AtomicU64>,
    ) {
        let mut pending: HashMap<(Uuid, StatKind), u64> = HashMap::new();
        let mut pending_total: u64 = 0;
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Record { token_id, kind, delta }) => {
                        *pending.entry((token_id, kind)).or_insert(0) += delta;
                        pending_total += delta;
                        if pending_total >= batch_size as u64 {
                            Self::flush(&store, &mut pending, &dropped, &flushed, &flush_failures).await;
                            pending_total = 0;
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        Self::flush(&store, &mut pending, &dropped, &flushed, &flush_failures).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        Self::flush(&store, &mut pending, &dropped, &flushed, &flush_failures).await;
                        pending_total = 0;
                    }
                }
            }
        }
        tracing::debug!("Stats aggregator loop exited");
    }

    async fn flush(
        store: &Arc<dyn TokenStore>,
        pending: &mut HashMap<(Uuid, StatKind), u64>,
        dropped: &AtomicU64,
        flushed: &AtomicU64,
        flush_failures: &AtomicU64,
    ) {
        for ((token_id, kind), delta) in pending.drain() {
            let result = match kind {
                StatKind::Request => store.increment_request_count(token_id, delta).await,
                StatKind::CacheHit => store.increment_cache_hits(token_id, delta).await,
            };
            match result {
                Ok(()) => {
                    flushed.fetch_add(delta, Ordering::Relaxed);
                }
                Err(err) => {
                    // Count the loss; the flush path never retries
                    flush_failures.fetch_add(1, Ordering::Relaxed);
                    dropped.fetch_add(delta, Ordering::Relaxed);
                    tracing::warn!(error = %err, ?kind, "Stats flush failed, deltas dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Project, TokenRecord};
    use chrono::Utc;

    async fn setup() -> (Arc<MemoryStore>, TokenRecord) {
        let store = Arc::new(MemoryStore::new());
        let project = store
            .create_project(Project::new("acme".into(), "sk".into()))
            .await
            .unwrap();
        let token = store
            .create_token(TokenRecord {
                id: Uuid::new_v4(),
                token: "wt_stats".into(),
                project_id: project.id,
                expires_at: None,
                is_active: true,
                request_count: 0,
                max_requests: None,
                cache_hit_count: 0,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .await
            .unwrap();
        (store, token)
    }

    #[tokio::test]
    async fn coalesces_and_flushes_on_shutdown() {
        let (store, token) = setup().await;
        let aggregator =
            StatsAggregator::new(store.clone(), 1000, Duration::from_secs(3600), 100);

        for _ in 0..5 {
            aggregator.record_request(token.id);
        }
        aggregator.record_cache_hit(token.id);
        aggregator.shutdown(Duration::from_secs(1)).await;

        let fetched = store.get_token("wt_stats").await.unwrap();
        assert_eq!(fetched.request_count, 5);
        assert_eq!(fetched.cache_hit_count, 1);

        let metrics = aggregator.metrics();
        assert_eq!(metrics.recorded, 6);
        assert_eq!(metrics.flushed, 6);
        assert_eq!(metrics.dropped, 0);
    }

    #[tokio::test]
    async fn flushes_when_batch_size_reached() {
        let (store, token) = setup().await;
        let aggregator = StatsAggregator::new(store.clone(), 3, Duration::from_secs(3600), 100);

        for _ in 0..3 {
            aggregator.record_request(token.id);
        }
        // Batch threshold reached; give the background task a beat
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fetched = store.get_token("wt_stats").await.unwrap();
        assert_eq!(fetched.request_count, 3);
        aggregator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unknown_token_counts_as_flush_failure() {
        let (store, _token) = setup().await;
        let aggregator = StatsAggregator::new(store.clone(), 1000, Duration::from_secs(3600), 100);
        aggregator.record_request(Uuid::new_v4());
        aggregator.shutdown(Duration::from_secs(1)).await;

        let metrics = aggregator.metrics();
        assert_eq!(metrics.flush_failures, 1);
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.flushed, 0);
    }
}
