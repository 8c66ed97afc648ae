//! Topic authorization for inbound subscribe requests
//!
//! A connection's claims may carry a `permitted_topics` set. When present,
//! every subscribe request from that connection must stay inside it. When
//! absent, the connection is unrestricted.

use std::collections::BTreeSet;

use crate::auth::Claims;
use crate::notifier::{ALL_TOPICS, TopicSelection};

/// Subscribe request referenced topics outside the granted set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid topics to subscribe: {}", join_topics(.topics))]
pub struct Unauthorized {
    /// Offending topics (`*` for a rejected wildcard request)
    pub topics: BTreeSet<String>,
}

fn join_topics(topics: &BTreeSet<String>) -> String {
    topics.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Gate applied to every subscribe request arriving over a connection
pub struct TopicAuthorizer;

impl TopicAuthorizer {
    /// Check `requested` against an optional granted set.
    ///
    /// A wildcard request is only legal when there is no restriction, since
    /// it cannot be checked against a finite set.
    pub fn check(
        requested: &TopicSelection,
        granted: Option<&BTreeSet<String>>,
    ) -> Result<(), Unauthorized> {
        let Some(granted) = granted else {
            return Ok(());
        };

        let offending: BTreeSet<String> = match requested {
            TopicSelection::All => BTreeSet::from([ALL_TOPICS.to_string()]),
            TopicSelection::Topics(topics) => topics.difference(granted).cloned().collect(),
        };

        if offending.is_empty() {
            Ok(())
        } else {
            Err(Unauthorized { topics: offending })
        }
    }

    /// Check a request against the restriction carried by `claims`
    pub fn verify_claims(requested: &TopicSelection, claims: &Claims) -> Result<(), Unauthorized> {
        Self::check(requested, claims.permitted_topics.as_ref())
    }
}
