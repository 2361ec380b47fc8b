//! Change notifications via a broadcast event bus.
//!
//! Replaces per-consumer registered callbacks: any number of consumers
//! subscribe to one bus and observe peer-list, location, annotation, and
//! channel changes without the engine depending on their types.

use tokio::sync::broadcast;

use fieldlink_proto::{Annotation, Channel, LocationUpdate};

use crate::peer::PeerRecord;

/// Buffered events per subscriber before lagging ones drop messages.
const EVENT_CAPACITY: usize = 256;

/// A change observed by the mesh engine.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// The live peer set changed; carries the full new snapshot.
    PeerListChanged(Vec<PeerRecord>),
    /// A peer location was merged.
    LocationUpdated(LocationUpdate),
    /// An annotation was accepted (created or replaced by a newer one).
    AnnotationUpdated(Annotation),
    /// The channel list changed; carries the full new list.
    ChannelsChanged(Vec<Channel>),
}

/// Publish side of the mesh event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer size.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having zero subscribers is not an error.
    pub fn publish(&self, event: MeshEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull-style collaborator consulted when building rebroadcast payloads,
/// letting an external store own the authoritative annotation set.
pub trait AnnotationProvider: Send + Sync {
    /// Annotations to include in the next outgoing full sync.
    fn annotations(&self) -> Vec<Annotation>;
}
