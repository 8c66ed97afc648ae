//! Relaycast - pub/sub hub server
//!
//! Listens for TCP clients speaking newline-delimited JSON and, when a
//! broadcast URI is configured, bridges publishes with other instances.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relaycast::{Config, Hub, HubError, server};

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "Multi-tenant pub/sub hub with cross-instance broadcast")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Listen address, overrides RELAYCAST_BIND
    #[arg(long)]
    bind: Option<String>,

    /// Backbone URI, overrides RELAYCAST_BROADCAST_URI
    #[arg(long)]
    broadcast_uri: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("Relaycast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(uri) = args.broadcast_uri {
        config.broadcast_uri = Some(uri);
    }

    info!(
        bind = %config.bind,
        backbone = config.broadcast_uri.as_deref().unwrap_or("off"),
        "Starting Relaycast"
    );

    let hub = Arc::new(Hub::from_config(&config)?);
    let shutdown = CancellationToken::new();

    // Losing the backbone leaves this instance partitioned; exit and let
    // the supervisor restart it
    {
        let shutdown = shutdown.clone();
        hub.on_backbone_disconnect(move || {
            let shutdown = shutdown.clone();
            async move {
                error!("Backbone connection lost, shutting down");
                shutdown.cancel();
            }
        })
        .await;
    }

    tokio::select! {
        started = hub.start() => match started {
            Ok(()) => {}
            Err(HubError::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting backbone");
            hub.stop().await;
            return Ok(());
        }
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    let listener = TcpListener::bind(&config.bind).await?;
    let served = server::serve(hub.clone(), listener, shutdown, config.handshake_timeout).await;

    hub.stop().await;
    info!("Relaycast stopped");
    served
}
