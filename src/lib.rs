//! Relaycast - multi-tenant pub/sub hub
//!
//! Clients connect over a long-lived connection, subscribe to named topics
//! and receive events published by other clients or by the server itself.
//! Tokens restrict which topics a client may subscribe to. Several hub
//! instances can share a backbone so a publish on one reaches subscribers
//! on all of them.
//!
//! ## Architecture
//!
//! ```text
//! Client (TCP) -> server -> Hub -> Notifier -> subscribers
//!                            |
//!                            +-> PublishDispatcher -> BackboneLifecycle -> other instances
//! ```
//!
//! ## Environment Variables
//!
//! - `RELAYCAST_BIND` - Listen address
//! - `RELAYCAST_AUTH_SECRET` - Token signing secret
//! - `RELAYCAST_BROADCAST_URI` - Backbone URI (`memory://`, `postgres://...`)
//!
//! See [`config`] for the rest.

pub mod auth;
pub mod authz;
pub mod backbone;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod keepalive;
pub mod notifier;
pub mod protocol;
pub mod registry;
pub mod server;

pub use auth::{Authenticator, Claims, OpenAuthenticator, TokenAuthenticator};
pub use authz::{TopicAuthorizer, Unauthorized};
pub use backbone::{Backbone, BackboneLifecycle, BackboneSettings, BackboneState, MemoryBackbone};
pub use config::Config;
pub use dispatch::{PublishDispatcher, Publisher};
pub use error::HubError;
pub use hub::{Channel, Connection, ConnectionInfo, Hub};
pub use notifier::{Event, Notifier, Subscription, TopicSelection};
pub use protocol::{ClientCommand, ServerMessage};
pub use registry::{ClientRegistry, ClientSession};

#[cfg(feature = "postgres")]
pub use backbone::PostgresBackbone;
