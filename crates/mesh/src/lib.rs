//! FieldLink Mesh - Peer-to-Peer Awareness Engine
//!
//! Self-organizing mesh networking for disconnected field operations:
//! nodes on the same network segment discover each other over UDP
//! broadcast, exchange positions, map annotations, and channel-scoped
//! audio, and converge on a shared versioned state without any central
//! coordinator.
//!
//! # Architecture
//!
//! [`MeshEngine`] is the entry point. It binds one UDP socket per traffic
//! class (discovery, location, audio, state sync, annotations), spawns a
//! listener task per socket plus timer tasks for announcing, pinging,
//! state rebroadcast, and cache flushing, and routes every inbound packet
//! through a single dispatch point that handles duplicate suppression,
//! acknowledgments, and latency sampling before the per-type handlers
//! run. Consumers observe the mesh through the [`events::EventBus`]
//! rather than registering callbacks.
//!
//! # Example
//!
//! ```rust,no_run
//! use fieldlink_mesh::{config::MeshConfig, engine::MeshEngine};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut engine = MeshEngine::new(MeshConfig::default());
//! let mut events = engine.subscribe();
//! engine.start().await?;
//! engine.send_location(34.05, -118.24).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod peer;
pub mod relay;
pub mod reliability;
pub mod state;
pub mod transport;

pub use config::MeshConfig;
pub use engine::{MeshEngine, MeshTransport};
pub use error::{MeshError, MeshResult};
pub use events::{AnnotationProvider, EventBus, MeshEvent};
pub use peer::{PeerId, PeerRecord};
