//! TCP transport
//!
//! Accepts connections, reads the handshake line, authenticates it and
//! hands the connection to the hub. Each connection then runs a loop that
//! multiplexes client commands, outbound events and server shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::hub::{Channel, Connection, ConnectionInfo, Hub};
use crate::protocol::{self, ClientCommand, Handshake, ServerMessage};

/// Accept connections until `shutdown` fires, then wait for every
/// connection task to finish.
pub async fn serve(
    hub: Arc<Hub>,
    listener: TcpListener,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
) -> anyhow::Result<()> {
    let tracker = TaskTracker::new();
    info!(addr = %listener.local_addr()?, "Accepting connections");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let hub = hub.clone();
                    let shutdown = shutdown.clone();
                    let span = info_span!("connection", peer = %addr);
                    tracker.spawn(
                        async move {
                            handle_stream(hub, stream, addr, shutdown, handshake_timeout).await;
                        }
                        .instrument(span),
                    );
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }

    tracker.close();
    info!(open = tracker.len(), "Waiting for connections to close");
    tracker.wait().await;
    Ok(())
}

async fn handle_stream(
    hub: Arc<Hub>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
) {
    let (read, writer) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let handshake = match tokio::time::timeout(handshake_timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => protocol::parse_handshake(line.as_bytes()),
        Ok(Ok(None)) => {
            debug!("peer left before handshake");
            return;
        }
        Ok(Err(e)) => {
            debug!(error = %e, "handshake read failed");
            return;
        }
        Err(_) => {
            debug!(timeout = ?handshake_timeout, "handshake timed out");
            return;
        }
    };

    let (handshake, claims) = match handshake {
        Ok(handshake) => {
            let claims = hub.authenticate(handshake.token.as_deref());
            (handshake, claims)
        }
        Err(e) => {
            debug!(error = %e, "invalid handshake");
            (Handshake::default(), None)
        }
    };

    let connection = TcpConnection {
        lines,
        writer,
        info: ConnectionInfo {
            remote_host: Some(addr.ip().to_string()),
            remote_port: Some(addr.port()),
            params: handshake.params,
        },
        shutdown,
        close_reason: if claims.is_some() { "closed" } else { "unauthorized" },
    };

    if let Err(e) = hub.handle_connection(connection, claims).await {
        debug!(error = %e, "connection ended with error");
    }
}

/// One client over TCP
pub struct TcpConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    info: ConnectionInfo,
    shutdown: CancellationToken,
    close_reason: &'static str,
}

#[async_trait]
impl Connection for TcpConnection {
    fn info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    async fn run(&mut self, mut channel: Channel) -> anyhow::Result<()> {
        let Self {
            lines,
            writer,
            shutdown,
            close_reason,
            ..
        } = self;

        write_message(
            writer,
            &ServerMessage::Welcome {
                client_id: channel.client_id().to_string(),
            },
        )
        .await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    *close_reason = "server_shutdown";
                    return Ok(());
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let reply = execute(&channel, &line);
                        write_message(writer, &reply).await?;
                    }
                    None => return Ok(()),
                },
                Some(event) = channel.next_event() => {
                    write_message(writer, &ServerMessage::from(event)).await?;
                }
            }
        }
    }

    async fn close(&mut self) {
        let goodbye = ServerMessage::Disconnect {
            reason: self.close_reason.to_string(),
        };
        if let Err(e) = write_message(&mut self.writer, &goodbye).await {
            debug!(error = %e, "could not send disconnect");
        }
        // Peer may already be gone
        let _ = self.writer.shutdown().await;
    }
}

/// Run one client command and build its reply
fn execute(channel: &Channel, line: &str) -> ServerMessage {
    let command = match protocol::parse_command(line.as_bytes()) {
        Ok(command) => command,
        Err(e) => {
            return ServerMessage::Error {
                reason: e.to_string(),
                topics: Vec::new(),
            };
        }
    };

    let name = command.name();
    match command {
        ClientCommand::Subscribe { topics } => {
            match channel.subscribe(protocol::selection(topics)) {
                Ok(_) => ServerMessage::Ack { command: name },
                Err(e) => ServerMessage::Error {
                    reason: e.to_string(),
                    topics: e.topics.into_iter().collect(),
                },
            }
        }
        ClientCommand::Unsubscribe { topics } => {
            channel.unsubscribe(&protocol::selection(topics));
            ServerMessage::Ack { command: name }
        }
        ClientCommand::Publish { topics, data } => {
            channel.publish(topics, data);
            ServerMessage::Ack { command: name }
        }
        ClientCommand::ClientInfo => match channel.client_info() {
            Some(clients) => ServerMessage::ClientInfo { clients },
            None => ServerMessage::Error {
                reason: "client_info requires unrestricted claims".to_string(),
                topics: Vec::new(),
            },
        },
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, msg: &ServerMessage) -> anyhow::Result<()> {
    let line = protocol::encode(msg)?;
    writer.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Claims, TokenAuthenticator};
    use crate::backbone::BackboneSettings;
    use serde_json::{Value, json};

    const SECRET: &str = "loopback-secret";

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr, handshake: Value) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, writer) = stream.into_split();
            let mut client = Self {
                lines: BufReader::new(read).lines(),
                writer,
            };
            client.send(handshake).await;
            client
        }

        async fn send(&mut self, msg: Value) {
            let mut line = serde_json::to_vec(&msg).unwrap();
            line.push(b'\n');
            self.writer.write_all(&line).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn start_server() -> (Arc<Hub>, SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let hub = Arc::new(Hub::new(
            Arc::new(TokenAuthenticator::new(SECRET)),
            None,
            BackboneSettings::default(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            hub.clone(),
            listener,
            shutdown.clone(),
            Duration::from_secs(5),
        ));
        let server = tokio::spawn(async move { server.await.unwrap().unwrap() });
        (hub, addr, shutdown, server)
    }

    fn token(topics: &[&str]) -> String {
        TokenAuthenticator::new(SECRET)
            .issue(&Claims::permitting(topics.iter().copied()))
            .unwrap()
    }

    fn unrestricted_token() -> String {
        TokenAuthenticator::new(SECRET)
            .issue(&Claims::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_loopback_session() {
        let (hub, addr, shutdown, server) = start_server().await;

        let mut client = Client::connect(
            addr,
            json!({"token": token(&["x", "y"]), "params": {"__relaycast_client_id": "c1"}}),
        )
        .await;
        let welcome = client.recv().await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["client_id"], "c1");

        client.send(json!({"command": "subscribe", "topics": ["x"]})).await;
        assert_eq!(client.recv().await, json!({"type": "ack", "command": "subscribe"}));

        client.send(json!({"command": "subscribe", "topics": ["x", "z"]})).await;
        let rejected = client.recv().await;
        assert_eq!(rejected["type"], "error");
        assert_eq!(rejected["topics"], json!(["z"]));

        let mut operator = Client::connect(addr, json!({"token": unrestricted_token()})).await;
        operator.recv().await;
        operator.send(json!({"command": "client_info"})).await;
        let info = operator.recv().await;
        assert_eq!(info["type"], "client_info");
        assert_eq!(info["clients"]["c1"]["subscribed_topics"], json!(["x"]));
        assert_eq!(info["clients"]["c1"]["active_count"], 1);

        hub.publish(["x"], json!({"rev": 1}));
        let event = client.recv().await;
        assert_eq!(event, json!({"type": "event", "topic": "x", "data": {"rev": 1}}));

        client.send(json!({"command": "bogus"})).await;
        assert_eq!(client.recv().await["type"], "error");

        shutdown.cancel();
        let goodbye = client.recv().await;
        assert_eq!(goodbye, json!({"type": "disconnect", "reason": "server_shutdown"}));
        server.await.unwrap();
        assert!(hub.list_clients().is_empty());
    }

    #[tokio::test]
    async fn test_client_publish_reaches_other_client() {
        let (_hub, addr, shutdown, server) = start_server().await;

        let mut reader = Client::connect(addr, json!({"token": token(&["news"])})).await;
        reader.recv().await;
        reader.send(json!({"command": "subscribe", "topics": ["news"]})).await;
        assert_eq!(reader.recv().await["type"], "ack");

        let mut writer = Client::connect(addr, json!({"token": token(&[])})).await;
        writer.recv().await;
        writer
            .send(json!({"command": "publish", "topics": ["news"], "data": "hello"}))
            .await;
        assert_eq!(writer.recv().await["command"], "publish");

        let event = reader.recv().await;
        assert_eq!(event["topic"], "news");
        assert_eq!(event["data"], "hello");

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_info_refused_for_restricted_tenant() {
        let (_hub, addr, shutdown, server) = start_server().await;

        let mut tenant_a = Client::connect(
            addr,
            json!({
                "token": token(&["a-topic"]),
                "params": {"__relaycast_client_id": "tenant-a", "api_key": "secret-of-a"}
            }),
        )
        .await;
        tenant_a.recv().await;

        let mut tenant_b = Client::connect(addr, json!({"token": token(&["only-b-topic"])})).await;
        tenant_b.recv().await;
        tenant_b.send(json!({"command": "client_info"})).await;
        let reply = tenant_b.recv().await;
        assert_eq!(reply["type"], "error");
        assert!(reply.get("clients").is_none());
        assert!(!reply.to_string().contains("secret-of-a"));

        let mut operator = Client::connect(addr, json!({"token": unrestricted_token()})).await;
        operator.recv().await;
        operator.send(json!({"command": "client_info"})).await;
        let info = operator.recv().await;
        assert_eq!(
            info["clients"]["tenant-a"]["connection_params"]["api_key"],
            "secret-of-a"
        );

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let (hub, addr, shutdown, server) = start_server().await;

        let mut client = Client::connect(addr, json!({"token": "forged--deadbeef"})).await;
        let goodbye = client.recv().await;
        assert_eq!(goodbye, json!({"type": "disconnect", "reason": "unauthorized"}));
        assert!(client.lines.next_line().await.unwrap().is_none());
        assert!(hub.list_clients().is_empty());

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_rejected() {
        let (_hub, addr, shutdown, server) = start_server().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut writer) = stream.into_split();
        writer.write_all(b"hello\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let goodbye: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(goodbye["reason"], "unauthorized");

        shutdown.cancel();
        server.await.unwrap();
    }
}
