//! Wire protocol
//!
//! Newline-delimited JSON over a byte stream. The first line a client sends
//! is the handshake; every line after that is a command.
//!
//! ## Handshake
//! `{"token": "...", "params": {"__relaycast_client_id": "..."}}`
//!
//! ## Client Commands
//! - `subscribe`: Join topics (`"*"` for every topic)
//! - `unsubscribe`: Leave topics
//! - `publish`: Send data to topics
//! - `client_info`: List connected clients
//!
//! ## Server Messages
//! - `welcome`: Connection accepted
//! - `event`: Data published on a subscribed topic
//! - `ack`: Command succeeded
//! - `error`: Command failed
//! - `client_info`: Connected clients
//! - `disconnect`: Connection closing

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notifier::{Event, TopicSelection};
use crate::registry::ClientSession;

/// First line sent by a client
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub token: Option<String>,
    /// Connection parameters, including the optional client id
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Client-to-server commands
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        topics: Vec<String>,
    },
    Unsubscribe {
        topics: Vec<String>,
    },
    Publish {
        topics: Vec<String>,
        #[serde(default)]
        data: Value,
    },
    ClientInfo,
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Publish { .. } => "publish",
            Self::ClientInfo => "client_info",
        }
    }
}

/// Server-to-client messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        client_id: String,
    },
    Event {
        topic: String,
        data: Value,
    },
    Ack {
        command: &'static str,
    },
    Error {
        reason: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        topics: Vec<String>,
    },
    ClientInfo {
        clients: HashMap<String, ClientSession>,
    },
    Disconnect {
        reason: String,
    },
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        Self::Event {
            topic: event.topic,
            data: event.data,
        }
    }
}

/// Topic list as sent by a client; `"*"` anywhere selects every topic
pub fn selection(topics: Vec<String>) -> TopicSelection {
    TopicSelection::topics(topics)
}

/// Parse the handshake line
pub fn parse_handshake(data: &[u8]) -> Result<Handshake, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Handshake)
}

/// Parse a client command from raw bytes
pub fn parse_command(data: &[u8]) -> Result<ClientCommand, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Parse)
}

/// Encode a server message as one line, newline included
pub fn encode(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(msg).map_err(ProtocolError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to parse handshake: {0}")]
    Handshake(#[source] serde_json::Error),
    #[error("failed to parse command: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}
