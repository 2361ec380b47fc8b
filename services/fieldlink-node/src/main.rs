//! FieldLink node daemon.
//!
//! Runs a headless mesh node: starts the engine from a TOML config file
//! (or defaults), logs mesh events, and shuts down cleanly on Ctrl-C.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{error, info};

use fieldlink_mesh::{logging, MeshConfig, MeshEngine, MeshEvent};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    logging::init();

    let config = match parse_config_path(&args)? {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            MeshConfig::from_file(&path)?
        }
        None => {
            info!("No --config given, using defaults");
            MeshConfig::default()
        }
    };

    let mut engine = MeshEngine::new(config);
    let mut events = engine.subscribe();
    engine.start().await?;
    info!("Node up as {}", engine.local_peer_id());

    let event_logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                MeshEvent::PeerListChanged(peers) => {
                    info!("Peer list changed: {} peer(s)", peers.len());
                }
                MeshEvent::LocationUpdated(update) => {
                    info!(
                        "Location from {}: {:.5}, {:.5}",
                        update.peer_id, update.latitude, update.longitude
                    );
                }
                MeshEvent::AnnotationUpdated(annotation) => {
                    info!("Annotation '{}' ({})", annotation.label, annotation.id);
                }
                MeshEvent::ChannelsChanged(channels) => {
                    info!("Channel list changed: {} channel(s)", channels.len());
                }
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down");
    engine.stop().await;
    event_logger.abort();
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            return match args_iter.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => Err(anyhow::anyhow!("--config was provided without a path")),
            };
        }
    }
    Ok(None)
}
