//! Backbone abstraction
//!
//! A backbone is a shared broadcast channel that several hub instances
//! connect to, so a publish on one instance reaches subscribers on all of
//! them.
//!
//! # Transports
//!
//! - `memory://` - in-process broadcast bus, single node or tests
//! - `postgres://` - PostgreSQL LISTEN/NOTIFY (`postgres` feature)

pub mod lifecycle;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use lifecycle::{BackboneLifecycle, BackboneSettings, BackboneState};
pub use memory::MemoryBackbone;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackbone;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A publish as carried over the backbone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Node id of the publishing hub instance
    pub origin: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

/// Receives envelopes arriving from the backbone
pub type InboundSink = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Backbone transport
///
/// Implementations relay inbound envelopes to the sink handed to
/// [`Backbone::connect`] until closed.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Connect and start relaying inbound envelopes to `inbound`
    async fn connect(&self, inbound: InboundSink) -> anyhow::Result<()>;

    /// Send an envelope to every connected instance
    async fn publish(&self, envelope: &Envelope) -> anyhow::Result<()>;

    /// Resolves once the connection has closed, for whatever reason
    async fn closed(&self);

    /// Close the connection
    async fn close(&self) -> anyhow::Result<()>;
}

/// Build a backbone from a broadcast URI
#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
pub fn from_uri(uri: &str, channel: &str) -> anyhow::Result<Arc<dyn Backbone>> {
    let scheme = uri.split_once("://").map(|(scheme, _)| scheme).unwrap_or("");

    match scheme {
        "memory" => Ok(Arc::new(MemoryBackbone::new())),
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Ok(Arc::new(PostgresBackbone::new(uri, channel))),
        _ => anyhow::bail!("unsupported broadcast uri scheme: {:?}", scheme),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_uri_memory() {
        assert!(from_uri("memory://", "EventNotifier").is_ok());
    }

    #[test]
    fn test_from_uri_unknown_scheme() {
        let err = from_uri("kafka://broker:9092", "EventNotifier").err().unwrap();
        assert!(err.to_string().contains("kafka"));
        assert!(from_uri("no-scheme", "EventNotifier").is_err());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_from_uri_postgres() {
        assert!(from_uri("postgresql://localhost/relay", "EventNotifier").is_ok());
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn test_from_uri_postgres_requires_feature() {
        let err = from_uri("postgres://localhost/relay", "EventNotifier").err().unwrap();
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    fn test_envelope_data_defaults_to_null() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"origin":"n1","topics":["a"]}"#).unwrap();
        assert_eq!(envelope.data, Value::Null);
    }
}
