//! In-process event notifier
//!
//! Maps topics to subscriber callbacks and fans published events out to
//! them. Subscribe/unsubscribe hooks fire synchronously on the caller's
//! task, which is what lets the client registry attribute them to the
//! connection being handled. Channel restrictions run before a remote
//! subscription is admitted.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::Claims;
use crate::authz::Unauthorized;

/// Topic name standing for "every topic"
pub const ALL_TOPICS: &str = "*";

/// Topics named by a subscribe or unsubscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSelection {
    /// Wildcard: every topic, present and future
    All,
    /// An explicit set of topics
    Topics(BTreeSet<String>),
}

impl TopicSelection {
    /// Build a selection from topic names; any `*` turns it into a wildcard
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        if topics.contains(ALL_TOPICS) {
            Self::All
        } else {
            Self::Topics(topics)
        }
    }

    /// Keys this selection occupies in the subscription map
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::All => vec![ALL_TOPICS.to_string()],
            Self::Topics(topics) => topics.iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Topics(topics) if topics.is_empty())
    }
}

/// A published event as seen by a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub data: Value,
}

/// Identifies one subscriber (a connection, or an in-process consumer)
pub type SubscriberId = String;

/// Invoked for every event on a subscribed topic
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Observes subscription changes
pub type SubscriptionHook = Box<dyn Fn(&str, &TopicSelection) + Send + Sync>;

/// Gate checked before a remote subscription is admitted
pub type ChannelRestriction =
    Box<dyn Fn(&TopicSelection, &Claims) -> Result<(), Unauthorized> + Send + Sync>;

/// Handle returned by a successful subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    pub topics: TopicSelection,
}

/// Topic fan-out with pluggable hooks
pub struct Notifier {
    /// topic (or `*`) -> subscriber -> callback
    topics: DashMap<String, HashMap<SubscriberId, EventCallback>>,
    subscribe_hooks: Vec<SubscriptionHook>,
    unsubscribe_hooks: Vec<SubscriptionHook>,
    restrictions: Vec<ChannelRestriction>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            subscribe_hooks: Vec::new(),
            unsubscribe_hooks: Vec::new(),
            restrictions: Vec::new(),
        }
    }

    pub fn register_subscribe_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str, &TopicSelection) + Send + Sync + 'static,
    {
        self.subscribe_hooks.push(Box::new(hook));
    }

    pub fn register_unsubscribe_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str, &TopicSelection) + Send + Sync + 'static,
    {
        self.unsubscribe_hooks.push(Box::new(hook));
    }

    /// Add a check run on every channel subscribe, before admission
    pub fn add_channel_restriction<F>(&mut self, restriction: F)
    where
        F: Fn(&TopicSelection, &Claims) -> Result<(), Unauthorized> + Send + Sync + 'static,
    {
        self.restrictions.push(Box::new(restriction));
    }

    /// Subscribe without restrictions (trusted, in-process callers)
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        topics: TopicSelection,
        callback: EventCallback,
    ) -> Subscription {
        for key in topics.keys() {
            self.topics
                .entry(key)
                .or_default()
                .insert(subscriber_id.to_string(), callback.clone());
        }

        debug!(subscriber = subscriber_id, topics = ?topics, "subscribed");

        for hook in &self.subscribe_hooks {
            hook(subscriber_id, &topics);
        }

        Subscription {
            subscriber_id: subscriber_id.to_string(),
            topics,
        }
    }

    /// Subscribe on behalf of a remote channel holding `claims`.
    ///
    /// Restrictions run first; a rejected request registers nothing and
    /// fires no hooks.
    pub fn subscribe_channel(
        &self,
        subscriber_id: &str,
        topics: TopicSelection,
        claims: &Claims,
        callback: EventCallback,
    ) -> Result<Subscription, Unauthorized> {
        for restriction in &self.restrictions {
            if let Err(e) = restriction(&topics, claims) {
                debug!(subscriber = subscriber_id, error = %e, "subscription rejected");
                return Err(e);
            }
        }

        Ok(self.subscribe(subscriber_id, topics, callback))
    }

    /// Remove a subscriber from the given topics
    pub fn unsubscribe(&self, subscriber_id: &str, topics: &TopicSelection) {
        for key in topics.keys() {
            self.remove_subscriber(&key, subscriber_id);
        }

        debug!(subscriber = subscriber_id, topics = ?topics, "unsubscribed");

        for hook in &self.unsubscribe_hooks {
            hook(subscriber_id, topics);
        }
    }

    /// Remove a subscriber from every topic it holds.
    ///
    /// Returns the removed keys, or `None` if it held nothing.
    pub fn unsubscribe_all(&self, subscriber_id: &str) -> Option<TopicSelection> {
        let keys: BTreeSet<String> = self
            .topics
            .iter()
            .filter(|entry| entry.value().contains_key(subscriber_id))
            .map(|entry| entry.key().clone())
            .collect();

        if keys.is_empty() {
            return None;
        }

        // Raw keys, so a literal `*` is removed alongside explicit topics
        let held = TopicSelection::Topics(keys);
        self.unsubscribe(subscriber_id, &held);
        Some(held)
    }

    fn remove_subscriber(&self, key: &str, subscriber_id: &str) {
        if let Some(mut subs) = self.topics.get_mut(key) {
            subs.remove(subscriber_id);
        }
        if self.topics.remove_if(key, |_, subs| subs.is_empty()).is_some() {
            debug!(topic = key, "removed empty topic");
        }
    }

    /// Deliver `data` to every subscriber of each topic.
    ///
    /// Wildcard subscribers receive each topic once. Callbacks run outside
    /// of map guards so they may subscribe or unsubscribe themselves.
    /// Returns the number of deliveries.
    pub fn notify(&self, topics: &[String], data: &Value) -> usize {
        let mut delivered = 0;

        for topic in topics {
            let mut callbacks: HashMap<SubscriberId, EventCallback> = HashMap::new();
            for key in [topic.as_str(), ALL_TOPICS] {
                if let Some(subs) = self.topics.get(key) {
                    for (id, callback) in subs.iter() {
                        callbacks.entry(id.clone()).or_insert_with(|| callback.clone());
                    }
                }
            }

            if callbacks.is_empty() {
                debug!(topic, "no subscribers for event");
                continue;
            }

            let event = Event {
                topic: topic.clone(),
                data: data.clone(),
            };
            for callback in callbacks.values() {
                callback(&event);
            }
            delivered += callbacks.len();
        }

        delivered
    }

    /// Number of subscribers registered directly on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("topics", &self.topics.len())
            .field("restrictions", &self.restrictions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::TopicAuthorizer;
    use std::sync::Mutex;

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: EventCallback = Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
        });
        (callback, events)
    }

    #[test]
    fn test_notify_reaches_topic_subscribers() {
        let notifier = Notifier::new();
        let (callback, events) = recorder();
        notifier.subscribe("s1", TopicSelection::topics(["a"]), callback);

        let delivered = notifier.notify(&["a".to_string(), "b".to_string()], &Value::from(7));

        assert_eq!(delivered, 1);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "a");
        assert_eq!(events[0].data, Value::from(7));
    }

    #[test]
    fn test_wildcard_subscriber_gets_each_topic_once() {
        let notifier = Notifier::new();
        let (callback, events) = recorder();
        notifier.subscribe("s1", TopicSelection::All, callback.clone());
        notifier.subscribe("s1", TopicSelection::topics(["a"]), callback);

        notifier.notify(&["a".to_string(), "b".to_string()], &Value::Null);

        let topics: Vec<String> = events.lock().unwrap().iter().map(|e| e.topic.clone()).collect();
        assert_eq!(topics, vec!["a", "b"]);
    }

    #[test]
    fn test_selection_with_star_is_wildcard() {
        assert_eq!(TopicSelection::topics(["a", "*"]), TopicSelection::All);
        assert!(TopicSelection::topics(Vec::<String>::new()).is_empty());
        assert!(!TopicSelection::All.is_empty());
    }

    #[test]
    fn test_restriction_blocks_before_hooks() {
        let mut notifier = Notifier::new();
        let hook_calls = Arc::new(Mutex::new(0));
        let calls = hook_calls.clone();
        notifier.register_subscribe_hook(move |_, _| *calls.lock().unwrap() += 1);
        notifier.add_channel_restriction(TopicAuthorizer::verify_claims);

        let claims = Claims {
            permitted_topics: Some(BTreeSet::from(["a".to_string()])),
            ..Default::default()
        };
        let (callback, _) = recorder();

        let err = notifier
            .subscribe_channel("s1", TopicSelection::topics(["b"]), &claims, callback.clone())
            .unwrap_err();
        assert_eq!(err.topics, BTreeSet::from(["b".to_string()]));
        assert_eq!(*hook_calls.lock().unwrap(), 0);
        assert_eq!(notifier.topic_count(), 0);

        notifier
            .subscribe_channel("s1", TopicSelection::topics(["a"]), &claims, callback)
            .unwrap();
        assert_eq!(*hook_calls.lock().unwrap(), 1);
        assert_eq!(notifier.subscriber_count("a"), 1);
    }

    #[test]
    fn test_unsubscribe_all_fires_hook_and_cleans_topics() {
        let mut notifier = Notifier::new();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        notifier.register_unsubscribe_hook(move |id, topics| {
            sink.lock().unwrap().push((id.to_string(), topics.clone()));
        });

        let (callback, _) = recorder();
        notifier.subscribe("s1", TopicSelection::topics(["a", "b"]), callback.clone());
        notifier.subscribe("s2", TopicSelection::topics(["a"]), callback);

        let held = notifier.unsubscribe_all("s1").unwrap();
        assert_eq!(held, TopicSelection::topics(["a", "b"]));
        assert_eq!(notifier.subscriber_count("a"), 1);
        assert_eq!(notifier.subscriber_count("b"), 0);
        assert_eq!(notifier.topic_count(), 1);
        assert_eq!(removed.lock().unwrap().len(), 1);

        assert!(notifier.unsubscribe_all("s1").is_none());
    }

    #[test]
    fn test_callback_may_unsubscribe_during_notify() {
        let notifier = Arc::new(Notifier::new());
        let inner = notifier.clone();
        let callback: EventCallback = Arc::new(move |_event: &Event| {
            inner.unsubscribe("s1", &TopicSelection::topics(["a"]));
        });
        notifier.subscribe("s1", TopicSelection::topics(["a"]), callback);

        assert_eq!(notifier.notify(&["a".to_string()], &Value::Null), 1);
        assert_eq!(notifier.subscriber_count("a"), 0);
    }
}
