//! Periodic publisher
//!
//! Publishes an empty message on a fixed topic at a fixed interval. Used to
//! keep the backbone session from being torn down by an idle timeout on the
//! transport side.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::dispatch::Publisher;

/// Default keepalive topic
pub const DEFAULT_KEEPALIVE_TOPIC: &str = "__broadcast_session_keepalive__";

pub struct PeriodicPublisher {
    publisher: Arc<dyn Publisher>,
    interval: Duration,
    topic: String,
    task_name: &'static str,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicPublisher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        interval: Duration,
        topic: impl Into<String>,
        task_name: &'static str,
    ) -> Self {
        Self {
            publisher,
            interval,
            topic: topic.into(),
            task_name,
            task: Mutex::new(None),
        }
    }

    /// Start publishing. The first message goes out one interval from now.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!(task = self.task_name, "periodic publisher already running");
            return;
        }

        info!(
            task = self.task_name,
            topic = %self.topic,
            interval = ?self.interval,
            "starting periodic publisher"
        );

        let publisher = self.publisher.clone();
        let topic = self.topic.clone();
        let period = self.interval;
        let task_name = self.task_name;

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                debug!(task = task_name, topic = %topic, "periodic publish");
                publisher.publish(vec![topic.clone()], Value::Null);
            }
        }));
    }

    /// Stop publishing. Safe to call when not running.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            // Cancellation is the expected outcome
            let _ = handle.await;
            info!(task = self.task_name, "stopped periodic publisher");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}
