//! Event dispatcher
//!
//! Drains the bus subscription, accumulates batches (by size or age), and
//! delivers each batch to every configured sink. Transient sink failures are
//! retried with exponential backoff and jitter; permanent failures and
//! exhausted retries drop the batch with a counter. Sink IO runs on the
//! dispatcher's own workers, never on the request path.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

mod file;
mod http;
mod sink;

pub use file::FileSink;
pub use http::HttpSink;
pub use sink::{EventSink, SinkError};

use crate::bus::EventBus;
use crate::config::DispatcherConfig;
use crate::events::ProxyEvent;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherMetrics {
    pub batches_sent: u64,
    pub events_sent: u64,
    pub batches_dropped: u64,
    pub events_dropped: u64,
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    batches_sent: AtomicU64,
    events_sent: AtomicU64,
    batches_dropped: AtomicU64,
    events_dropped: AtomicU64,
    retries: AtomicU64,
}

pub struct Dispatcher {
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sinks: Vec<Arc<dyn EventSink>>,
    metrics: Arc<Counters>,
    drain_timeout: Duration,
}

impl Dispatcher {
    /// Subscribe to the bus and start the worker pool.
    pub async fn start(
        config: DispatcherConfig,
        sinks: Vec<Arc<dyn EventSink>>,
        bus: &dyn EventBus,
    ) -> Self {
        let rx = bus.subscribe().await;
        let shared_rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, _) = watch::channel(false);
        let metrics = Arc::new(Counters::default());

        let mut workers = Vec::new();
        for worker_id in 0..config.workers.max(1) {
            let shared_rx = Arc::clone(&shared_rx);
            let sinks = sinks.clone();
            let config = config.clone();
            let metrics = Arc::clone(&metrics);
            let shutdown_rx = shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, shared_rx, sinks, config, metrics, shutdown_rx).await;
            }));
        }

        tracing::info!(
            workers = config.workers.max(1),
            sinks = sinks.len(),
            batch_size = config.batch_size,
            "Dispatcher started"
        );

        Self {
            shutdown: shutdown_tx,
            workers: Mutex::new(workers),
            sinks,
            metrics,
            drain_timeout: config.drain_timeout,
        }
    }

    async fn worker_loop(
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<ProxyEvent>>>,
        sinks: Vec<Arc<dyn EventSink>>,
        config: DispatcherConfig,
        metrics: Arc<Counters>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let (batch, done) = Self::collect_batch(&rx, &config, &mut shutdown_rx).await;
            if !batch.is_empty() {
                for sink in &sinks {
                    Self::deliver_with_retry(sink.as_ref(), &batch, &config, &metrics).await;
                }
            }
            if done {
                break;
            }
        }
        tracing::debug!(worker_id, "Dispatcher worker exited");
    }

    /// Accumulate up to `batch_size` events or until `flush_interval` has
    /// passed since the first event. Returns `done = true` once the channel
    /// is closed or a drain has emptied it.
    async fn collect_batch(
        rx: &Arc<Mutex<mpsc::Receiver<ProxyEvent>>>,
        config: &DispatcherConfig,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> (Vec<ProxyEvent>, bool) {
        let mut batch = Vec::new();
        let mut age_deadline: Option<Instant> = None;

        loop {
            if batch.len() >= config.batch_size.max(1) {
                return (batch, false);
            }

            let draining = *shutdown_rx.borrow();
            let mut guard = rx.lock().await;

            if draining {
                // No more waiting: pull whatever is buffered and finish
                match guard.try_recv() {
                    Ok(event) => {
                        drop(guard);
                        batch.push(event);
                        continue;
                    }
                    Err(_) => return (batch, true),
                }
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: treat like a drain request
                        return (batch, true);
                    }
                    // Re-enter the loop in drain mode
                    continue;
                }
                maybe = guard.recv() => {
                    drop(guard);
                    match maybe {
                        Some(event) => {
                            if age_deadline.is_none() {
                                age_deadline = Some(Instant::now() + config.flush_interval);
                            }
                            batch.push(event);
                        }
                        None => return (batch, true),
                    }
                }
                _ = async {
                    tokio::time::sleep_until(age_deadline.expect("guarded by condition").into()).await
                }, if age_deadline.is_some() => {
                    return (batch, false);
                }
            }
        }
    }

    async fn deliver_with_retry(
        sink: &dyn EventSink,
        batch: &[ProxyEvent],
        config: &DispatcherConfig,
        metrics: &Counters,
    ) {
        let mut attempt: u32 = 0;
        loop {
            match sink.send(batch).await {
                Ok(()) => {
                    metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .events_sent
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    return;
                }
                Err(SinkError::Permanent(err)) => {
                    metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .events_dropped
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    tracing::error!(
                        sink = sink.name(),
                        error = %err,
                        events = batch.len(),
                        "Permanent sink failure, batch dropped"
                    );
                    return;
                }
                Err(SinkError::Transient(err)) => {
                    if attempt >= config.max_retries {
                        metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
                        metrics
                            .events_dropped
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                        tracing::warn!(
                            sink = sink.name(),
                            error = %err,
                            attempts = attempt + 1,
                            "Retries exhausted, batch dropped"
                        );
                        return;
                    }
                    metrics.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(config.retry_backoff, attempt);
                    tracing::debug!(
                        sink = sink.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient sink failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Stop accepting work, drain buffered events up to the drain deadline,
    /// then close the sinks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + self.drain_timeout;

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, worker).await.is_err() {
                tracing::warn!("Dispatcher worker did not drain in time");
            }
        }

        for sink in &self.sinks {
            sink.close().await;
        }
        tracing::debug!("Dispatcher shutdown complete");
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        DispatcherMetrics {
            batches_sent: self.metrics.batches_sent.load(Ordering::Relaxed),
            events_sent: self.metrics.events_sent.load(Ordering::Relaxed),
            batches_dropped: self.metrics.batches_dropped.load(Ordering::Relaxed),
            events_dropped: self.metrics.events_dropped.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
        }
    }
}

/// Exponential backoff with jitter. The jitter source is the std hasher's
/// random state, which avoids a dedicated rng dependency.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_range = (base.as_millis() as u64 / 2).max(1);
    let random = RandomState::new().build_hasher().finish();
    exp + Duration::from_millis(random % jitter_range)
}
