//! Backbone connection lifecycle
//!
//! ```text
//! disabled -> connecting -> connected -> draining -> closed
//!                              |                        ^
//!                              +--------> lost ---------+
//! ```
//!
//! Connect attempts retry on a fixed interval until they succeed or the hub
//! stops. Once connected, an optional keepalive publishes on a reserved
//! topic and a watcher waits for the backbone to report closure, then runs
//! the registered disconnect callbacks. A connection the backbone reports
//! closed is `lost` and takes no more relays. Stopping cancels the watcher,
//! drains outstanding publishes and only then closes the connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backbone::{Backbone, Envelope, InboundSink};
use crate::dispatch::Publisher;
use crate::error::HubError;
use crate::keepalive::{DEFAULT_KEEPALIVE_TOPIC, PeriodicPublisher};
use crate::notifier::Notifier;

/// Default delay between backbone connect attempts
pub const DEFAULT_CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Default keepalive interval
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3600);

/// Async callback run after the backbone reports closure
pub type DisconnectCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneState {
    /// Not configured, or configured but not started
    Disabled,
    Connecting,
    Connected,
    /// The backbone reported closure while connected
    Lost,
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct BackboneSettings {
    pub connect_retry_interval: Duration,
    /// Zero disables the keepalive
    pub keepalive_interval: Duration,
    pub keepalive_topic: String,
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            connect_retry_interval: DEFAULT_CONNECT_RETRY_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_topic: DEFAULT_KEEPALIVE_TOPIC.to_string(),
        }
    }
}

/// Background tasks owned while connected
#[derive(Default)]
struct Tasks {
    keepalive: Option<PeriodicPublisher>,
    watcher: Option<(CancellationToken, JoinHandle<()>)>,
}

pub struct BackboneLifecycle {
    /// Id stamped on outgoing envelopes; inbound ones carrying it are ours
    node_id: String,
    backbone: RwLock<Option<Arc<dyn Backbone>>>,
    settings: BackboneSettings,
    notifier: Arc<Notifier>,
    state: watch::Sender<BackboneState>,
    /// Serializes start/stop transitions
    tasks: Mutex<Tasks>,
    shutdown: CancellationToken,
    disconnect_callbacks: Mutex<Vec<DisconnectCallback>>,
}

impl BackboneLifecycle {
    pub fn new(
        backbone: Option<Arc<dyn Backbone>>,
        settings: BackboneSettings,
        notifier: Arc<Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(BackboneState::Disabled);
        Self {
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            backbone: RwLock::new(backbone),
            settings,
            notifier,
            state,
            tasks: Mutex::new(Tasks::default()),
            shutdown: CancellationToken::new(),
            disconnect_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Lifecycle with no backbone; every operation is a no-op
    pub fn disabled(notifier: Arc<Notifier>) -> Self {
        Self::new(None, BackboneSettings::default(), notifier)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> BackboneState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<BackboneState> {
        self.state.subscribe()
    }

    pub async fn is_configured(&self) -> bool {
        self.backbone.read().await.is_some()
    }

    fn set_state(&self, state: BackboneState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "backbone state changed");
        }
    }

    /// Register a callback run when the backbone connection is lost
    pub async fn on_disconnect<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disconnect_callbacks
            .lock()
            .await
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Connect (retrying until success), then start the closure watcher and
    /// the keepalive. A no-op without a configured backbone.
    ///
    /// Blocks until connected. Returns [`HubError::Cancelled`] if the
    /// lifecycle is stopped while still connecting.
    pub async fn start(self: &Arc<Self>, publisher: Arc<dyn Publisher>) -> Result<(), HubError> {
        let Some(link) = self.backbone.read().await.clone() else {
            debug!("backbone not configured");
            return Ok(());
        };

        let mut tasks = self.tasks.lock().await;
        if self.state() != BackboneState::Disabled {
            debug!(state = ?self.state(), "backbone already started");
            return Ok(());
        }

        self.set_state(BackboneState::Connecting);
        info!("Waiting for successful backbone connection");
        if let Err(e) = self.connect_with_retry(&link).await {
            self.set_state(BackboneState::Disabled);
            return Err(e);
        }
        self.set_state(BackboneState::Connected);
        info!(node_id = %self.node_id, "Backbone connected");

        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        let this = self.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("backbone watcher cancelled");
                }
                _ = this.wait_until_done() => {
                    info!("backbone watcher finished");
                }
            }
        });
        tasks.watcher = Some((token, watcher));

        if !self.settings.keepalive_interval.is_zero() {
            let keepalive = PeriodicPublisher::new(
                publisher,
                self.settings.keepalive_interval,
                self.settings.keepalive_topic.clone(),
                "backbone keepalive task",
            );
            keepalive.start().await;
            tasks.keepalive = Some(keepalive);
        }

        Ok(())
    }

    async fn connect_with_retry(&self, link: &Arc<dyn Backbone>) -> Result<(), HubError> {
        let interval = self.settings.connect_retry_interval;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(HubError::Cancelled),
                result = link.connect(self.inbound_sink()) => result,
            };

            match result {
                Ok(()) => {
                    debug!(attempt, "backbone connect succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, retry_in = ?interval, "backbone connect failed");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(HubError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Deliver inbound envelopes from other instances to local subscribers
    fn inbound_sink(&self) -> InboundSink {
        let notifier = self.notifier.clone();
        let node_id = self.node_id.clone();
        Arc::new(move |envelope: Envelope| {
            // Local subscribers already saw our own publishes
            if envelope.origin == node_id {
                return;
            }
            let delivered = notifier.notify(&envelope.topics, &envelope.data);
            debug!(origin = %envelope.origin, topics = ?envelope.topics, delivered, "inbound backbone event");
        })
    }

    /// Send a local publish to the other instances.
    ///
    /// Only relays while connected or draining; returns whether it was sent.
    pub async fn relay(&self, topics: &[String], data: &Value) -> anyhow::Result<bool> {
        if !matches!(
            self.state(),
            BackboneState::Connected | BackboneState::Draining
        ) {
            return Ok(false);
        }

        let Some(link) = self.backbone.read().await.clone() else {
            return Ok(false);
        };

        let envelope = Envelope {
            origin: self.node_id.clone(),
            topics: topics.to_vec(),
            data: data.clone(),
        };
        link.publish(&envelope).await?;
        Ok(true)
    }

    /// Resolves when the backbone reports closure and every disconnect
    /// callback has been awaited
    pub async fn wait_until_done(&self) {
        let link = self.backbone.read().await.clone();
        if let Some(link) = link {
            link.closed().await;
            warn!("backbone connection closed");
            self.state.send_if_modified(|state| {
                if *state != BackboneState::Connected {
                    return false;
                }
                *state = BackboneState::Lost;
                debug!(from = ?BackboneState::Connected, to = ?BackboneState::Lost, "backbone state changed");
                true
            });
        }

        let pending: Vec<BoxFuture<'static, ()>> = self
            .disconnect_callbacks
            .lock()
            .await
            .iter()
            .map(|callback| callback())
            .collect();
        for callback in pending {
            callback.await;
        }
    }

    /// Stop: keepalive first, then cancel the watcher and drain outstanding
    /// work together with it, then close and release the backbone.
    ///
    /// Failures along the way are logged; the lifecycle always ends
    /// `closed`. Calling it again is a no-op.
    pub async fn stop<D>(&self, drain: D)
    where
        D: Future<Output = ()>,
    {
        // Unblocks a start() still retrying, which holds the task lock
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;

        if self.state() == BackboneState::Closed {
            debug!("backbone already closed");
            return;
        }

        if let Some(keepalive) = tasks.keepalive.take() {
            keepalive.stop().await;
        }

        if !self.is_configured().await {
            drain.await;
            return;
        }

        // A lost link has nothing to relay the drain to
        if self.state() != BackboneState::Lost {
            self.set_state(BackboneState::Draining);
        }

        let watcher = tasks.watcher.take();
        if let Some((token, _)) = &watcher {
            token.cancel();
        }
        let watcher_done = async {
            if let Some((_, handle)) = watcher
                && let Err(e) = handle.await
                && !e.is_cancelled()
            {
                error!(error = %e, "backbone watcher failed");
            }
        };
        tokio::join!(drain, watcher_done);

        let link = self.backbone.write().await.take();
        if let Some(link) = link
            && let Err(e) = link.close().await
        {
            error!(error = %e, "failed to close backbone");
        }

        self.set_state(BackboneState::Closed);
        info!("Backbone closed");
    }
}

impl std::fmt::Debug for BackboneLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackboneLifecycle")
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .finish()
    }
}
