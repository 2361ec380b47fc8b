//! Typed payloads carried inside framed packets.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Partial-update field name for the channel list.
pub const FIELD_CHANNELS: &str = "channels";
/// Partial-update field name for the peer-location map.
pub const FIELD_PEER_LOCATIONS: &str = "peer_locations";
/// Partial-update field name for the annotation list.
pub const FIELD_ANNOTATIONS: &str = "annotations";

/// Self-announcement broadcast on the discovery port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryAnnounce {
    /// Human-readable node name
    pub nickname: String,
    /// Capabilities this node advertises (e.g. "audio", "annotations")
    pub capabilities: HashSet<String>,
    /// Peer IDs this node currently knows about
    pub known_peers: HashSet<String>,
    /// Average network quality across the node's peers, in [0, 1]
    pub network_quality: f64,
    /// Version counter of the node's locally-owned shared state
    pub last_state_version: u64,
}

/// Position report for a single peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    /// Peer the position belongs to
    pub peer_id: String,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Sender clock when the fix was taken (Unix epoch milliseconds)
    pub timestamp_ms: u64,
}

/// A map annotation shared across the mesh.
///
/// Annotations are owned by an external store; the mesh only merges them
/// by ID with last-writer-wins on the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Stable annotation identifier
    pub id: String,
    /// Short label shown on the map
    pub label: String,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Display color, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Last modification time (Unix epoch milliseconds); conflict key
    pub timestamp_ms: u64,
}

/// Envelope for a single annotation on the annotation port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationMessage {
    /// The annotation being propagated
    pub annotation: Annotation,
}

/// A talk/data channel known to the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Stable channel identifier
    pub id: String,
    /// Display name
    pub name: String,
}

/// Version stamp for a node's locally-owned shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersion {
    /// Monotonically increasing counter, authoritative for acceptance
    pub version: u64,
    /// Sender clock at version creation (informational only)
    pub timestamp_ms: u64,
    /// Peer that owns this state
    pub peer_id: String,
}

/// Full or partial snapshot of the shared mesh state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncMessage {
    /// Version of the sender's state this message carries
    pub version: StateVersion,
    /// Channel list (full, or merged when named in `update_fields`)
    #[serde(default)]
    pub channels: Vec<Channel>,
    /// Peer ID -> last known position
    #[serde(default)]
    pub peer_locations: HashMap<String, LocationUpdate>,
    /// Annotation list
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    /// True when only the fields named in `update_fields` are present
    pub partial_update: bool,
    /// Field names carried by a partial update
    #[serde(default)]
    pub update_fields: HashSet<String>,
}

impl StateSyncMessage {
    /// Build a full-replacement sync message.
    pub fn full(
        version: StateVersion,
        channels: Vec<Channel>,
        peer_locations: HashMap<String, LocationUpdate>,
        annotations: Vec<Annotation>,
    ) -> Self {
        Self {
            version,
            channels,
            peer_locations,
            annotations,
            partial_update: false,
            update_fields: HashSet::new(),
        }
    }

    /// Build a partial sync message carrying only the named fields.
    pub fn partial(version: StateVersion, update_fields: HashSet<String>) -> Self {
        Self {
            version,
            channels: Vec::new(),
            peer_locations: HashMap::new(),
            annotations: Vec::new(),
            partial_update: true,
            update_fields,
        }
    }
}

/// Parse a JSON payload into a message type, tagging decode failures with
/// the packet kind for log context.
pub fn parse_payload<'a, T: Deserialize<'a>>(
    kind: &'static str,
    payload: &'a [u8],
) -> Result<T, ProtoError> {
    serde_json::from_slice(payload).map_err(|source| ProtoError::Payload { kind, source })
}
