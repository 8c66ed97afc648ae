//! Hub
//!
//! Composition root. Owns the client registry, the notifier (with the topic
//! authorizer installed as its channel restriction and the registry as its
//! subscription hooks), the backbone lifecycle and the publish dispatcher.
//!
//! Connections are handed in by a transport together with the claims its
//! authenticator produced; the hub registers the client, runs the
//! transport's message loop with the client attributed, and unwinds
//! everything when the loop ends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, Claims, OpenAuthenticator, TokenAuthenticator};
use crate::authz::{TopicAuthorizer, Unauthorized};
use crate::backbone::{self, Backbone, BackboneLifecycle, BackboneSettings, BackboneState};
use crate::config::Config;
use crate::dispatch::PublishDispatcher;
use crate::error::HubError;
use crate::notifier::{Event, EventCallback, Notifier, Subscription, TopicSelection};
use crate::registry::{self, ClientRegistry, ClientSession, derive_identity};

/// Default per-connection event queue capacity
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Metadata a transport knows about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    /// Handshake parameters
    pub params: HashMap<String, String>,
}

/// A transport-level connection
#[async_trait]
pub trait Connection: Send {
    fn info(&self) -> ConnectionInfo;

    /// Run the message loop until the peer goes away
    async fn run(&mut self, channel: Channel) -> anyhow::Result<()>;

    /// Close the underlying transport
    async fn close(&mut self);
}

/// Hub-side handle given to a connection's message loop
pub struct Channel {
    client_id: String,
    subscriber_id: String,
    claims: Claims,
    notifier: Arc<Notifier>,
    dispatcher: Arc<PublishDispatcher>,
    registry: Arc<ClientRegistry>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
}

impl Channel {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Subscribe this connection, subject to its claims
    pub fn subscribe(&self, topics: TopicSelection) -> Result<Subscription, Unauthorized> {
        let tx = self.events_tx.clone();
        let subscriber_id = self.subscriber_id.clone();
        let callback: EventCallback = Arc::new(move |event: &Event| {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %subscriber_id, topic = %event.topic, "subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = %subscriber_id, "subscriber gone");
                }
            }
        });

        registry::with_attribution(self.client_id.clone(), || {
            self.notifier
                .subscribe_channel(&self.subscriber_id, topics, &self.claims, callback)
        })
    }

    pub fn unsubscribe(&self, topics: &TopicSelection) {
        registry::with_attribution(self.client_id.clone(), || {
            self.notifier.unsubscribe(&self.subscriber_id, topics);
        });
    }

    /// Fire-and-forget publish on behalf of this connection
    pub fn publish(&self, topics: Vec<String>, data: Value) {
        self.dispatcher.submit(topics, data);
    }

    /// Next event for this connection
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Introspection listing of every connected client.
    ///
    /// Only for connections with unrestricted claims; a topic-restricted
    /// tenant gets `None` and never sees other clients' parameters.
    pub fn client_info(&self) -> Option<HashMap<String, ClientSession>> {
        if self.claims.permitted_topics.is_some() {
            debug!(client_id = %self.client_id, "client info refused for restricted claims");
            return None;
        }
        Some(self.registry.list())
    }
}

/// Removes a subscriber from the notifier when the connection ends.
///
/// Runs outside client attribution, so topics recorded for an identity
/// shared with other open connections are left alone.
struct SubscriberCleanup {
    notifier: Arc<Notifier>,
    subscriber_id: String,
}

impl Drop for SubscriberCleanup {
    fn drop(&mut self) {
        if let Some(topics) = self.notifier.unsubscribe_all(&self.subscriber_id) {
            debug!(subscriber = %self.subscriber_id, topics = ?topics, "removed connection subscriptions");
        }
    }
}

/// Pub/sub hub
pub struct Hub {
    registry: Arc<ClientRegistry>,
    notifier: Arc<Notifier>,
    backbone: Arc<BackboneLifecycle>,
    dispatcher: Arc<PublishDispatcher>,
    authenticator: Arc<dyn Authenticator>,
    subscriber_buffer: usize,
}

impl Hub {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        backbone: Option<Arc<dyn Backbone>>,
        settings: BackboneSettings,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new());

        let mut notifier = Notifier::new();
        notifier.add_channel_restriction(TopicAuthorizer::verify_claims);
        let tracker = registry.clone();
        notifier.register_subscribe_hook(move |id, topics| tracker.on_subscribe(id, topics));
        let tracker = registry.clone();
        notifier.register_unsubscribe_hook(move |id, topics| tracker.on_unsubscribe(id, topics));
        let notifier = Arc::new(notifier);

        if backbone.is_some() {
            info!("Initializing backbone for server<->server communication");
        } else {
            info!("Backbone is off");
        }

        let backbone = Arc::new(BackboneLifecycle::new(backbone, settings, notifier.clone()));
        let dispatcher = Arc::new(PublishDispatcher::new(notifier.clone(), backbone.clone()));

        Self {
            registry,
            notifier,
            backbone,
            dispatcher,
            authenticator,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }

    /// Hub with authentication disabled and no backbone
    pub fn standalone() -> Self {
        Self::new(Arc::new(OpenAuthenticator), None, BackboneSettings::default())
    }

    /// Build from configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let authenticator: Arc<dyn Authenticator> = match config.auth_secret {
            Some(ref secret) => Arc::new(TokenAuthenticator::new(secret)),
            None => {
                warn!("No auth secret configured - authentication disabled");
                Arc::new(OpenAuthenticator)
            }
        };

        let backbone = config
            .broadcast_uri
            .as_deref()
            .map(|uri| backbone::from_uri(uri, &config.broadcast_channel))
            .transpose()?;

        Ok(Self::new(authenticator, backbone, config.backbone_settings())
            .with_subscriber_buffer(config.subscriber_buffer))
    }

    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity.max(1);
        self
    }

    /// Connect the backbone, if configured. Blocks until connected.
    pub async fn start(&self) -> Result<(), HubError> {
        self.backbone.start(self.dispatcher.clone()).await
    }

    /// Drain publishes and shut the backbone down. Never fails; safe to
    /// call more than once.
    pub async fn stop(&self) {
        self.backbone.stop(self.dispatcher.join()).await;
        info!("Hub stopped");
    }

    /// Resolves once the backbone connection is lost and the disconnect
    /// callbacks have run
    pub async fn wait_until_done(&self) {
        self.backbone.wait_until_done().await;
    }

    /// Register an async callback for backbone loss
    pub async fn on_backbone_disconnect<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.backbone.on_disconnect(callback).await;
    }

    pub fn backbone_state(&self) -> BackboneState {
        self.backbone.state()
    }

    /// Claims for a handshake token, `None` to reject
    pub fn authenticate(&self, token: Option<&str>) -> Option<Claims> {
        self.authenticator.authenticate(token)
    }

    /// Serve one connection.
    ///
    /// Without claims the connection is closed unregistered. Otherwise the
    /// client is registered and attributed for the whole message loop, and
    /// both are released before the transport is closed.
    pub async fn handle_connection<C: Connection>(
        &self,
        mut connection: C,
        claims: Option<Claims>,
    ) -> Result<(), HubError> {
        let info = connection.info();

        let Some(claims) = claims else {
            info!(
                remote_host = ?info.remote_host,
                remote_port = ?info.remote_port,
                reason = "Authentication failed",
                "Closing connection"
            );
            connection.close().await;
            return Err(HubError::AuthenticationFailed);
        };

        let result = self.run_session(&mut connection, info, claims).await;
        connection.close().await;
        result
    }

    async fn run_session<C: Connection>(
        &self,
        connection: &mut C,
        info: ConnectionInfo,
        claims: Claims,
    ) -> Result<(), HubError> {
        let identity = derive_identity(info.remote_host.as_deref(), info.remote_port, &info.params);
        let guard = self
            .registry
            .acquire(identity, info.remote_host, info.remote_port, info.params);
        let client_id = guard.identity().to_string();

        let channel = self.channel(client_id.clone(), claims);
        let cleanup = SubscriberCleanup {
            notifier: self.notifier.clone(),
            subscriber_id: channel.subscriber_id().to_string(),
        };

        info!(client_id = %client_id, active = guard.session().active_count, "Client connected");

        let result = registry::attributed(client_id.clone(), connection.run(channel)).await;

        drop(cleanup);
        drop(guard);

        match result {
            Ok(()) => {
                info!(client_id = %client_id, "Client disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Connection loop failed");
                Err(HubError::Connection(e))
            }
        }
    }

    fn channel(&self, client_id: String, claims: Claims) -> Channel {
        let (events_tx, events_rx) = mpsc::channel(self.subscriber_buffer);
        Channel {
            subscriber_id: format!("{}#{}", client_id, uuid::Uuid::new_v4().simple()),
            client_id,
            claims,
            notifier: self.notifier.clone(),
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            events_tx,
            events_rx,
        }
    }

    /// Fire-and-forget publish
    pub fn publish<I, S>(&self, topics: I, data: Value)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dispatcher
            .submit(topics.into_iter().map(Into::into).collect(), data);
    }

    /// Publish and wait for local delivery and the backbone relay
    pub async fn publish_sync(&self, topics: &[String], data: &Value) -> anyhow::Result<usize> {
        self.dispatcher.publish_sync(topics, data).await
    }

    /// In-process subscription. Trusted: no authorization gate.
    pub fn subscribe(&self, topics: TopicSelection, callback: EventCallback) -> Subscription {
        let subscriber_id = format!("local#{}", uuid::Uuid::new_v4().simple());
        self.notifier.subscribe(&subscriber_id, topics, callback)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.notifier
            .unsubscribe(&subscription.subscriber_id, &subscription.topics);
    }

    /// Currently tracked clients, for diagnostics
    pub fn list_clients(&self) -> HashMap<String, ClientSession> {
        self.registry.list()
    }

    /// Publishes still in flight
    pub fn pending_publishes(&self) -> usize {
        self.dispatcher.pending()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.registry.len())
            .field("topics", &self.notifier.topic_count())
            .field("backbone", &self.backbone.state())
            .finish()
    }
}
