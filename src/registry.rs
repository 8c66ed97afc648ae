//! Client session registry
//!
//! Tracks which logical clients are connected and what they subscribe to.
//! Several connections may share one identity (reconnect races, a client
//! with overlapping sessions); they share one [`ClientSession`] whose
//! `active_count` says how many are open.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, warn};

use crate::notifier::TopicSelection;

/// Handshake parameter a client uses to declare its own stable identity
pub const CLIENT_ID_PARAM: &str = "__relaycast_client_id";

tokio::task_local! {
    /// Identity of the connection whose message loop is running on this task
    static CURRENT_CLIENT: String;
}

/// One logical client, possibly backed by several open connections
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSession {
    pub identity: String,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    /// Unix seconds of the first connection under this identity
    pub connected_at: f64,
    /// Union of topics subscribed by every open connection
    pub subscribed_topics: BTreeSet<String>,
    pub active_count: usize,
    pub connection_params: HashMap<String, String>,
}

/// Derive the identity for a new connection.
///
/// First match wins: explicit handshake parameter, remote address and
/// port, then a random token.
pub fn derive_identity(
    remote_host: Option<&str>,
    remote_port: Option<u16>,
    params: &HashMap<String, String>,
) -> String {
    if let Some(client_id) = params.get(CLIENT_ID_PARAM) {
        return client_id.clone();
    }

    if let (Some(host), Some(port)) = (remote_host, remote_port) {
        return format!("host:{}:{}", host, port);
    }

    format!("relaycast:{}", uuid::Uuid::new_v4().simple())
}

/// Identity attributed to the current task, if any
pub fn current_identity() -> Option<String> {
    CURRENT_CLIENT.try_with(|identity| identity.clone()).ok()
}

/// Run `fut` with `identity` attributed to it
pub async fn attributed<F: Future>(identity: String, fut: F) -> F::Output {
    CURRENT_CLIENT.scope(identity, fut).await
}

/// Run `f` synchronously with `identity` attributed to it
pub fn with_attribution<R>(identity: String, f: impl FnOnce() -> R) -> R {
    CURRENT_CLIENT.sync_scope(identity, f)
}

/// Identity -> session table
pub struct ClientRegistry {
    clients: DashMap<String, ClientSession>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register one open connection under `identity`.
    ///
    /// Lookup-or-create and the count increment happen under the entry
    /// lock, so racing connections coalesce into one session. The
    /// returned guard undoes the registration when dropped.
    pub fn acquire(
        &self,
        identity: String,
        remote_host: Option<String>,
        remote_port: Option<u16>,
        params: HashMap<String, String>,
    ) -> ClientGuard<'_> {
        let session = {
            let mut entry = self
                .clients
                .entry(identity.clone())
                .or_insert_with(|| ClientSession {
                    identity: identity.clone(),
                    remote_host,
                    remote_port,
                    connected_at: unix_now(),
                    subscribed_topics: BTreeSet::new(),
                    active_count: 0,
                    connection_params: params,
                });
            entry.active_count += 1;
            entry.value().clone()
        };

        debug!(client_id = %identity, active = session.active_count, "client session acquired");

        ClientGuard {
            registry: self,
            session,
        }
    }

    fn release(&self, identity: &str) {
        match self.clients.entry(identity.to_string()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                session.active_count = session.active_count.saturating_sub(1);
                if session.active_count == 0 {
                    entry.remove();
                    debug!(client_id = identity, "client session removed");
                } else {
                    debug!(
                        client_id = identity,
                        active = session.active_count,
                        "client session released"
                    );
                }
            }
            Entry::Vacant(_) => {
                warn!(client_id = identity, "release for unknown client session");
            }
        }
    }

    /// Point-in-time copy of every registered session
    pub fn list(&self) -> HashMap<String, ClientSession> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn get(&self, identity: &str) -> Option<ClientSession> {
        self.clients.get(identity).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Add topics to the session of `identity`
    pub fn record_subscribe(&self, identity: &str, topics: &TopicSelection) {
        if let Some(mut session) = self.clients.get_mut(identity) {
            session.subscribed_topics.extend(topics.keys());
        }
    }

    /// Remove topics from the session of `identity`
    pub fn record_unsubscribe(&self, identity: &str, topics: &TopicSelection) {
        if let Some(mut session) = self.clients.get_mut(identity) {
            for topic in topics.keys() {
                session.subscribed_topics.remove(&topic);
            }
        }
    }

    /// Subscribe hook: attribute to the current connection, if any.
    ///
    /// In-process subscribers run without attribution; that is a no-op.
    pub fn on_subscribe(&self, subscriber_id: &str, topics: &TopicSelection) {
        match current_identity() {
            Some(identity) => self.record_subscribe(&identity, topics),
            None => debug!(subscriber = subscriber_id, "subscribe without client attribution"),
        }
    }

    /// Unsubscribe hook, see [`ClientRegistry::on_subscribe`]
    pub fn on_unsubscribe(&self, subscriber_id: &str, topics: &TopicSelection) {
        match current_identity() {
            Some(identity) => self.record_unsubscribe(&identity, topics),
            None => debug!(subscriber = subscriber_id, "unsubscribe without client attribution"),
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .finish()
    }
}

/// Scoped registration of one connection; releases on drop
pub struct ClientGuard<'a> {
    registry: &'a ClientRegistry,
    session: ClientSession,
}

impl ClientGuard<'_> {
    pub fn identity(&self) -> &str {
        &self.session.identity
    }

    /// Session as it was right after this acquisition
    pub fn session(&self) -> &ClientSession {
        &self.session
    }
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.session.identity);
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn acquire<'a>(registry: &'a ClientRegistry, identity: &str) -> ClientGuard<'a> {
        registry.acquire(identity.to_string(), None, None, HashMap::new())
    }

    #[test]
    fn test_identity_prefers_explicit_param() {
        let params = HashMap::from([(CLIENT_ID_PARAM.to_string(), "c1".to_string())]);
        assert_eq!(derive_identity(Some("10.0.0.1"), Some(4000), &params), "c1");
    }

    #[test]
    fn test_identity_from_host_and_port() {
        assert_eq!(
            derive_identity(Some("10.0.0.1"), Some(4000), &HashMap::new()),
            "host:10.0.0.1:4000"
        );
    }

    #[test]
    fn test_identity_random_without_address() {
        let a = derive_identity(Some("10.0.0.1"), None, &HashMap::new());
        let b = derive_identity(None, None, &HashMap::new());
        assert!(a.starts_with("relaycast:"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_visible_only_while_acquired() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());

        let first = acquire(&registry, "c1");
        let second = acquire(&registry, "c1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("c1").unwrap().active_count, 2);

        drop(first);
        assert_eq!(registry.get("c1").unwrap().active_count, 1);

        drop(second);
        assert!(registry.get("c1").is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_first_writer_wins() {
        let registry = ClientRegistry::new();
        let first = registry.acquire(
            "c1".to_string(),
            Some("10.0.0.1".to_string()),
            Some(1),
            HashMap::new(),
        );
        let second = registry.acquire(
            "c1".to_string(),
            Some("10.0.0.2".to_string()),
            Some(2),
            HashMap::new(),
        );

        assert_eq!(second.session().connected_at, first.session().connected_at);
        assert_eq!(second.session().remote_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(second.session().active_count, 2);
    }

    #[test]
    fn test_topics_survive_partial_disconnect_only() {
        let registry = ClientRegistry::new();
        let first = acquire(&registry, "c1");
        let second = acquire(&registry, "c1");

        registry.record_subscribe("c1", &TopicSelection::topics(["x", "y"]));
        drop(first);
        assert_eq!(
            registry.get("c1").unwrap().subscribed_topics,
            BTreeSet::from(["x".to_string(), "y".to_string()])
        );

        drop(second);
        let third = acquire(&registry, "c1");
        assert!(third.session().subscribed_topics.is_empty());
    }

    #[test]
    fn test_list_is_a_copy() {
        let registry = ClientRegistry::new();
        let _guard = acquire(&registry, "c1");

        let mut listing = registry.list();
        listing.get_mut("c1").unwrap().active_count = 99;
        listing.remove("c1");

        assert_eq!(registry.get("c1").unwrap().active_count, 1);
    }

    #[test]
    fn test_concurrent_acquire_release_balances() {
        let registry = Arc::new(ClientRegistry::new());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let registry = registry.clone();
                scope.spawn(move || {
                    for _ in 0..500 {
                        let guard = acquire(&registry, "shared");
                        assert!(registry.get("shared").unwrap().active_count >= 1);
                        drop(guard);
                    }
                });
            }
        });

        assert!(registry.is_empty());
    }

    #[test]
    fn test_hooks_without_attribution_are_noop() {
        let registry = ClientRegistry::new();
        let _guard = acquire(&registry, "c1");

        registry.on_subscribe("broadcaster", &TopicSelection::All);
        registry.on_unsubscribe("broadcaster", &TopicSelection::topics(["x"]));

        assert!(registry.get("c1").unwrap().subscribed_topics.is_empty());
    }

    #[test]
    fn test_sync_attribution_routes_hook() {
        let registry = ClientRegistry::new();
        let _guard = acquire(&registry, "c1");

        with_attribution("c1".to_string(), || {
            registry.on_subscribe("sub", &TopicSelection::topics(["x"]));
        });
        assert_eq!(
            registry.get("c1").unwrap().subscribed_topics,
            BTreeSet::from(["x".to_string()])
        );
        assert!(current_identity().is_none());
    }

    #[tokio::test]
    async fn test_attribution_is_per_task() {
        let registry = Arc::new(ClientRegistry::new());
        let _a = acquire(&registry, "a");
        let _b = acquire(&registry, "b");

        let mut handles = Vec::new();
        for (identity, topic) in [("a", "ta"), ("b", "tb")] {
            let registry = registry.clone();
            handles.push(tokio::spawn(attributed(identity.to_string(), async move {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    registry.on_subscribe("sub", &TopicSelection::topics([topic]));
                }
                current_identity()
            })));
        }

        let seen: Vec<Option<String>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(seen, vec![Some("a".to_string()), Some("b".to_string())]);

        assert_eq!(
            registry.get("a").unwrap().subscribed_topics,
            BTreeSet::from(["ta".to_string()])
        );
        assert_eq!(
            registry.get("b").unwrap().subscribed_topics,
            BTreeSet::from(["tb".to_string()])
        );
    }
}
