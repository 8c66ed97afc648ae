//! PostgreSQL backbone using LISTEN/NOTIFY
//!
//! Every hub instance LISTENs on one channel and relays publishes with
//! `pg_notify`. Envelopes travel as JSON text, so a single event is bounded
//! by the server's NOTIFY payload limit (8000 bytes by default).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backbone::{Backbone, Envelope, InboundSink};

pub struct PostgresBackbone {
    connection_string: String,
    channel: String,
    link: Mutex<Option<Link>>,
}

struct Link {
    client: Arc<Client>,
    driver: JoinHandle<()>,
    closed: CancellationToken,
}

impl PostgresBackbone {
    /// Backbone for `database_url`, listening on `channel`. Does not
    /// connect; that happens in [`Backbone::connect`].
    pub fn new(database_url: &str, channel: &str) -> Self {
        Self {
            connection_string: database_url.to_string(),
            channel: Self::sanitize_channel(channel),
            link: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Channel names must be valid unquoted identifiers. `LISTEN` folds
    /// those to lower case while `pg_notify` takes the name verbatim, so
    /// both sides use the lowered form.
    fn sanitize_channel(name: &str) -> String {
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();

        if sanitized.chars().next().is_none_or(|c| c.is_ascii_digit()) {
            format!("ch_{}", sanitized)
        } else {
            sanitized
        }
    }
}

#[async_trait]
impl Backbone for PostgresBackbone {
    async fn connect(&self, inbound: InboundSink) -> anyhow::Result<()> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(|l| !l.closed.is_cancelled()) {
            debug!("postgres backbone already connected");
            return Ok(());
        }

        let (client, mut connection) = tokio_postgres::connect(&self.connection_string, NoTls).await?;

        let closed = CancellationToken::new();
        let done = closed.clone();
        let channel = self.channel.clone();

        // Notifications only surface while the connection is polled
        let driver = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = done.cancelled() => break,
                    msg = std::future::poll_fn(|cx| connection.poll_message(cx)) => msg,
                };
                match msg {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        if notification.channel() != channel {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(notification.payload()) {
                            Ok(envelope) => inbound(envelope),
                            Err(e) => warn!(error = %e, "dropping malformed envelope"),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "postgres backbone connection error");
                        break;
                    }
                    None => {
                        info!("postgres backbone connection ended");
                        break;
                    }
                }
            }
            done.cancel();
        });

        if let Err(e) = client.batch_execute(&format!("LISTEN {}", self.channel)).await {
            closed.cancel();
            driver.abort();
            return Err(e.into());
        }
        info!(channel = %self.channel, "Listening on backbone channel");

        *link = Some(Link {
            client: Arc::new(client),
            driver,
            closed,
        });
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let client = self
            .link
            .lock()
            .await
            .as_ref()
            .map(|l| l.client.clone())
            .ok_or_else(|| anyhow::anyhow!("postgres backbone not connected"))?;

        let payload = serde_json::to_string(envelope)?;
        client
            .execute("SELECT pg_notify($1, $2)", &[&self.channel, &payload])
            .await?;
        Ok(())
    }

    async fn closed(&self) {
        let token = self.link.lock().await.as_ref().map(|l| l.closed.clone());
        if let Some(token) = token {
            token.cancelled().await;
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };

        if !link.closed.is_cancelled()
            && let Err(e) = link.client.batch_execute(&format!("UNLISTEN {}", self.channel)).await
        {
            warn!(error = %e, "UNLISTEN failed");
        }

        link.closed.cancel();
        if let Err(e) = link.driver.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "postgres backbone driver failed");
        }
        debug!("postgres backbone closed");
        Ok(())
    }
}
