//! kvlink - networked key-value store
//!
//! Serves one store over a single TCP port.

use kvlink_core::{OriginTag, SessionEvent};
use kvlink_server::{DaemonConfig, Server};
use kvlink_store::LogStoreFactory;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if KVLINK_CONFIG is set, then env overrides)
    let mut config = match DaemonConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("KVLINK_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    // Load auth secrets from external file if configured
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }

    let manifest_out = config.manifest_out.take();
    let server_config = config.into_server_config()?;

    tracing::info!("Starting kvlink server");
    tracing::info!("  Location: {}", server_config.location);
    tracing::info!("  Listen: {}:{}", server_config.host, server_config.port);
    match &server_config.hooks.authenticator {
        Some(_) => tracing::info!("  Authentication: enabled"),
        None => tracing::info!("  Authentication: disabled"),
    }

    if let Some(path) = manifest_out {
        server_config.manifest.save(&path)?;
        tracing::info!("  Manifest written to {}", path.display());
    }

    let server = Server::new(server_config, LogStoreFactory)?;
    let mut events = server.subscribe();
    server.start()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.is(OriginTag::Database, &SessionEvent::Close) => {
                    tracing::warn!("Store closed, shutting down");
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping server...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");
    Ok(())
}
