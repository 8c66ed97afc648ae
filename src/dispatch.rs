//! Publish dispatch
//!
//! Decouples publishers from delivery: every publish runs as its own
//! tracked task, so callers never wait on slow subscribers or backbone
//! latency, and shutdown can still wait for in-flight messages.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span, warn};

use crate::backbone::BackboneLifecycle;
use crate::notifier::Notifier;

/// Fire-and-forget publish
pub trait Publisher: Send + Sync {
    fn publish(&self, topics: Vec<String>, data: Value);
}

pub struct PublishDispatcher {
    tracker: TaskTracker,
    notifier: Arc<Notifier>,
    backbone: Arc<BackboneLifecycle>,
}

impl PublishDispatcher {
    pub fn new(notifier: Arc<Notifier>, backbone: Arc<BackboneLifecycle>) -> Self {
        let tracker = TaskTracker::new();
        // Closed for good: spawning still works and wait() resolves
        // whenever the set is empty
        tracker.close();

        Self {
            tracker,
            notifier,
            backbone,
        }
    }

    /// Schedule a publish and return immediately.
    ///
    /// Failures are logged; they never reach the caller or sibling
    /// publishes.
    pub fn submit(&self, topics: Vec<String>, data: Value) {
        let notifier = self.notifier.clone();
        let backbone = self.backbone.clone();
        let span = info_span!("topic_publisher.publish", topics = ?topics);

        self.tracker.spawn(
            async move {
                if let Err(e) = deliver(&notifier, &backbone, &topics, &data).await {
                    warn!(error = %e, "publish failed");
                }
            }
            .instrument(span),
        );
    }

    /// Deliver now: local subscribers, then the backbone
    pub async fn publish_sync(&self, topics: &[String], data: &Value) -> anyhow::Result<usize> {
        deliver(&self.notifier, &self.backbone, topics, data).await
    }

    /// Wait until every publish submitted so far has finished
    pub async fn join(&self) {
        debug!(pending = self.tracker.len(), "joining outstanding publishes");
        self.tracker.wait().await;
    }

    /// Publishes still in flight
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}

impl Publisher for PublishDispatcher {
    fn publish(&self, topics: Vec<String>, data: Value) {
        self.submit(topics, data);
    }
}

async fn deliver(
    notifier: &Notifier,
    backbone: &BackboneLifecycle,
    topics: &[String],
    data: &Value,
) -> anyhow::Result<usize> {
    let delivered = notifier.notify(topics, data);
    let relayed = backbone.relay(topics, data).await?;
    debug!(delivered, relayed, "published");
    Ok(delivered)
}

impl std::fmt::Debug for PublishDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishDispatcher")
            .field("pending", &self.tracker.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{Event, EventCallback, TopicSelection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn dispatcher_with(notifier: Notifier) -> PublishDispatcher {
        let notifier = Arc::new(notifier);
        let backbone = Arc::new(BackboneLifecycle::disabled(notifier.clone()));
        PublishDispatcher::new(notifier, backbone)
    }

    fn counting_subscriber(notifier: &Notifier, topic: &str, delay: Duration) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: EventCallback = Arc::new(move |event: &Event| {
            if event.topic == "boom" {
                panic!("subscriber failure");
            }
            std::thread::sleep(delay);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        notifier.subscribe("counter", TopicSelection::topics([topic, "boom"]), callback);
        count
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_returns_before_delivery_and_join_waits() {
        let notifier = Notifier::new();
        let count = counting_subscriber(&notifier, "slow", Duration::from_millis(100));
        let dispatcher = dispatcher_with(notifier);

        let started = Instant::now();
        for _ in 0..4 {
            dispatcher.submit(vec!["slow".to_string()], Value::Null);
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        dispatcher.join().await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_publish_is_isolated() {
        let notifier = Notifier::new();
        let count = counting_subscriber(&notifier, "ok", Duration::ZERO);
        let dispatcher = dispatcher_with(notifier);

        dispatcher.submit(vec!["boom".to_string()], Value::Null);
        dispatcher.submit(vec!["ok".to_string()], Value::from(1));
        dispatcher.submit(vec!["ok".to_string()], Value::from(2));

        dispatcher.join().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_join_with_nothing_pending() {
        let dispatcher = dispatcher_with(Notifier::new());
        tokio::time::timeout(Duration::from_secs(1), dispatcher.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_sync_counts_deliveries() {
        let notifier = Notifier::new();
        let count = counting_subscriber(&notifier, "a", Duration::ZERO);
        let dispatcher = dispatcher_with(notifier);

        let delivered = dispatcher
            .publish_sync(&["a".to_string(), "b".to_string()], &Value::Null)
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
