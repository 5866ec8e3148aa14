//! In-process event bus
//!
//! One bounded channel per subscriber. A slow subscriber only loses its own
//! events; other subscribers and the publisher are unaffected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BusMetrics, EventBus};
use crate::events::ProxyEvent;

pub struct InProcessBus {
    buffer_size: usize,
    subscribers: Mutex<Vec<mpsc::Sender<ProxyEvent>>>,
    published: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl InProcessBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            subscribers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, event: ProxyEvent) {
        if self.closed.load(Ordering::Relaxed) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        if subscribers.is_empty() {
            // Nothing listening; the event is gone, which is fine
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Drop newest for this subscriber only
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    async fn subscribe(&self) -> mpsc::Receiver<ProxyEvent> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            // Dropping the senders ends every subscription
            subscribers.clear();
        }
    }

    fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(id: &str) -> ProxyEvent {
        ProxyEvent {
            request_id: id.into(),
            timestamp: Utc::now(),
            method: "GET".into(),
            path: "/v1/models".into(),
            status: 200,
            duration_ms: 1,
            project_id: None,
            token: None,
            response_headers: vec![],
            request_body: None,
            response_body: None,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = InProcessBus::new(10);
        let mut rx1 = bus.subscribe().await;
        let mut rx2 = bus.subscribe().await;

        bus.publish(event("a")).await;

        assert_eq!(rx1.recv().await.unwrap().request_id, "a");
        assert_eq!(rx2.recv().await.unwrap().request_id, "a");
    }

    #[tokio::test]
    async fn per_publisher_order_is_fifo() {
        let bus = InProcessBus::new(10);
        let mut rx = bus.subscribe().await;
        for id in ["1", "2", "3"] {
            bus.publish(event(id)).await;
        }
        assert_eq!(rx.recv().await.unwrap().request_id, "1");
        assert_eq!(rx.recv().await.unwrap().request_id, "2");
        assert_eq!(rx.recv().await.unwrap().request_id, "3");
    }

    #[tokio::test]
    async fn full_buffer_drops_newest_and_counts() {
        let bus = InProcessBus::new(2);
        let mut rx = bus.subscribe().await;

        bus.publish(event("1")).await;
        bus.publish(event("2")).await;
        bus.publish(event("3")).await; // buffer full, dropped

        assert_eq!(bus.metrics().dropped, 1);
        assert_eq!(rx.recv().await.unwrap().request_id, "1");
        assert_eq!(rx.recv().await.unwrap().request_id, "2");
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let bus = InProcessBus::new(1);
        let mut fast = bus.subscribe().await;
        let _slow = bus.subscribe().await; // never drained

        bus.publish(event("1")).await;
        assert_eq!(fast.recv().await.unwrap().request_id, "1");
        bus.publish(event("2")).await; // slow subscriber's buffer now overflows
        assert_eq!(fast.recv().await.unwrap().request_id, "2");
        assert_eq!(bus.metrics().dropped, 1);
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_drops_publishes() {
        let bus = InProcessBus::new(10);
        let mut rx = bus.subscribe().await;
        bus.close().await;

        assert!(rx.recv().await.is_none());
        bus.publish(event("late")).await;
        assert_eq!(bus.metrics().dropped, 1);
    }
}
