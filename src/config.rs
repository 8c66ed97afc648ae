//! Relaycast configuration
//!
//! Configuration comes from environment variables, with command-line
//! overrides applied on top in `main`.

use std::time::Duration;

use crate::backbone::BackboneSettings;
use crate::backbone::lifecycle::{DEFAULT_CONNECT_RETRY_INTERVAL, DEFAULT_KEEPALIVE_INTERVAL};
use crate::hub::DEFAULT_SUBSCRIBER_BUFFER;
use crate::keepalive::DEFAULT_KEEPALIVE_TOPIC;

/// Default listen address
pub const DEFAULT_BIND: &str = "0.0.0.0:7002";

/// Default backbone channel name
pub const DEFAULT_BROADCAST_CHANNEL: &str = "EventNotifier";

/// Relaycast configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub bind: String,
    /// HMAC secret for client tokens; unset disables authentication
    pub auth_secret: Option<String>,
    /// Backbone URI (`memory://`, `postgres://...`); unset disables it
    pub broadcast_uri: Option<String>,
    pub broadcast_channel: String,
    /// Zero disables the keepalive
    pub keepalive_interval: Duration,
    pub keepalive_topic: String,
    pub connect_retry_interval: Duration,
    /// Per-connection event queue capacity
    pub subscriber_buffer: usize,
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            auth_secret: None,
            broadcast_uri: None,
            broadcast_channel: DEFAULT_BROADCAST_CHANNEL.to_string(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_topic: DEFAULT_KEEPALIVE_TOPIC.to_string(),
            connect_retry_interval: DEFAULT_CONNECT_RETRY_INTERVAL,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            handshake_timeout: Duration::from_millis(5000),
        }
    }
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        // Empty values count as unset
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind) = get("RELAYCAST_BIND") {
            config.bind = bind;
        }
        config.auth_secret = get("RELAYCAST_AUTH_SECRET");
        config.broadcast_uri = get("RELAYCAST_BROADCAST_URI");

        if let Some(channel) = get("RELAYCAST_BROADCAST_CHANNEL") {
            config.broadcast_channel = channel;
        }

        if let Some(secs) = get("RELAYCAST_BROADCAST_KEEPALIVE_INTERVAL") {
            config.keepalive_interval = Duration::from_secs(parse(
                "RELAYCAST_BROADCAST_KEEPALIVE_INTERVAL",
                &secs,
                "expected seconds",
            )?);
        }

        if let Some(topic) = get("RELAYCAST_BROADCAST_KEEPALIVE_TOPIC") {
            config.keepalive_topic = topic;
        }

        if let Some(secs) = get("RELAYCAST_BROADCAST_CONNECT_RETRY_INTERVAL") {
            config.connect_retry_interval = Duration::from_secs(parse(
                "RELAYCAST_BROADCAST_CONNECT_RETRY_INTERVAL",
                &secs,
                "expected seconds",
            )?);
        }

        if let Some(size) = get("RELAYCAST_SUBSCRIBER_BUFFER") {
            let size: usize = parse("RELAYCAST_SUBSCRIBER_BUFFER", &size, "expected positive integer")?;
            if size == 0 {
                return Err(ConfigError::InvalidEnv(
                    "RELAYCAST_SUBSCRIBER_BUFFER",
                    "expected positive integer",
                ));
            }
            config.subscriber_buffer = size;
        }

        if let Some(ms) = get("RELAYCAST_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = Duration::from_millis(parse(
                "RELAYCAST_HANDSHAKE_TIMEOUT_MS",
                &ms,
                "expected milliseconds",
            )?);
        }

        Ok(config)
    }

    pub fn backbone_settings(&self) -> BackboneSettings {
        BackboneSettings {
            connect_retry_interval: self.connect_retry_interval,
            keepalive_interval: self.keepalive_interval,
            keepalive_topic: self.keepalive_topic.clone(),
        }
    }
}

fn parse<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(key, expected))
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
