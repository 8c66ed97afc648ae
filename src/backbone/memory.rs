//! In-memory backbone using tokio::sync::broadcast
//!
//! Single-process only. Hub instances sharing a bus through
//! [`MemoryBackbone::peer`] behave as one logical bus, which is enough for
//! single-node deployments and for exercising multi-instance behavior in
//! tests.

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backbone::{Backbone, Envelope, InboundSink};

/// Default buffer size for the broadcast bus
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// In-memory backbone
///
/// # Limitations
/// - Single-process only
/// - No message persistence
/// - Lagging listeners lose messages
pub struct MemoryBackbone {
    bus: broadcast::Sender<Vec<u8>>,
    link: Mutex<Option<Link>>,
}

struct Link {
    listener: JoinHandle<()>,
    closed: CancellationToken,
}

impl MemoryBackbone {
    /// Create a backbone on a fresh bus
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create with custom buffer size
    ///
    /// Larger buffers reduce message loss for slow listeners
    /// but consume more memory.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (bus, _) = broadcast::channel(buffer_size);
        Self {
            bus,
            link: Mutex::new(None),
        }
    }

    /// Another, unconnected backbone on the same bus
    pub fn peer(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            link: Mutex::new(None),
        }
    }

    /// Drop the link as if the remote side went away
    pub async fn sever(&self) {
        if let Some(link) = self.link.lock().await.as_ref() {
            link.closed.cancel();
        }
    }

    /// Number of connected listeners on the bus
    pub fn listener_count(&self) -> usize {
        self.bus.receiver_count()
    }
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn connect(&self, inbound: InboundSink) -> anyhow::Result<()> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(|l| !l.closed.is_cancelled()) {
            debug!("memory backbone already connected");
            return Ok(());
        }

        let mut rx = self.bus.subscribe();
        let closed = CancellationToken::new();
        let done = closed.clone();

        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(payload) => match serde_json::from_slice::<Envelope>(&payload) {
                            Ok(envelope) => inbound(envelope),
                            Err(e) => warn!(error = %e, "dropping malformed envelope"),
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "backbone listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            done.cancel();
        });

        *link = Some(Link { listener, closed });
        debug!("memory backbone connected");
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(envelope)?;

        // send() returns Err only if there are no listeners
        let _ = self.bus.send(payload);

        Ok(())
    }

    async fn closed(&self) {
        let token = self.link.lock().await.as_ref().map(|l| l.closed.clone());
        if let Some(token) = token {
            token.cancelled().await;
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(link) = self.link.lock().await.take() {
            link.closed.cancel();
            if let Err(e) = link.listener.await {
                warn!(error = %e, "memory backbone listener failed");
            }
            debug!("memory backbone closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    fn collector() -> (InboundSink, Arc<StdMutex<Vec<Envelope>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = received.clone();
        let inbound: InboundSink = Arc::new(move |envelope| sink.lock().unwrap().push(envelope));
        (inbound, received)
    }

    fn envelope(origin: &str, topic: &str) -> Envelope {
        Envelope {
            origin: origin.to_string(),
            topics: vec![topic.to_string()],
            data: Value::from("payload"),
        }
    }

    #[tokio::test]
    async fn test_peers_share_bus() {
        let a = MemoryBackbone::new();
        let b = a.peer();
        let (sink, received) = collector();

        b.connect(sink).await.unwrap();
        a.publish(&envelope("a", "policy")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*received.lock().unwrap(), vec![envelope("a", "policy")]);
    }

    #[tokio::test]
    async fn test_close_stops_listener() {
        let backbone = MemoryBackbone::new();
        let (sink, received) = collector();

        backbone.connect(sink).await.unwrap();
        assert_eq!(backbone.listener_count(), 1);

        backbone.close().await.unwrap();
        assert_eq!(backbone.listener_count(), 0);

        backbone.publish(&envelope("x", "t")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(received.lock().unwrap().is_empty());

        // closing twice is harmless
        backbone.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sever_resolves_closed() {
        let backbone = MemoryBackbone::new();
        let (sink, _) = collector();
        backbone.connect(sink).await.unwrap();

        let waiter = tokio::time::timeout(Duration::from_millis(50), backbone.closed()).await;
        assert!(waiter.is_err(), "closed() must pend while connected");

        backbone.sever().await;
        tokio::time::timeout(Duration::from_secs(1), backbone.closed())
            .await
            .unwrap();
    }
}
