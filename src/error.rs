//! Hub error taxonomy
//!
//! Only authentication and authorization failures reach the party that
//! caused them. Everything else is logged and absorbed.

use crate::authz::Unauthorized;

/// Errors surfaced by the hub
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Connection presented no valid claims
    #[error("authentication failed")]
    AuthenticationFailed,
    /// Subscribe request outside the granted topics
    #[error(transparent)]
    Unauthorized(#[from] Unauthorized),
    /// Backbone connect was abandoned because the hub is stopping
    #[error("backbone connect cancelled by shutdown")]
    Cancelled,
    /// The per-connection message loop failed
    #[error(transparent)]
    Connection(#[from] anyhow::Error),
}
