//! Shared mesh state and synchronization merge rules.
//!
//! Each node owns one versioned snapshot of channels, peer locations,
//! and annotations. Incoming sync messages are accepted only when their
//! version is strictly newer than the last accepted version from the
//! same owner; that per-owner check is the sole ordering guarantee.
//! Entity-level conflicts use last-writer-wins: annotation timestamps,
//! unconditional overwrite for locations, upsert-by-id for channels.

use std::collections::HashMap;

use fieldlink_proto::{
    Annotation, Channel, LocationUpdate, StateSyncMessage, StateVersion, FIELD_ANNOTATIONS,
    FIELD_CHANNELS, FIELD_PEER_LOCATIONS,
};

/// Highest state version accepted from each remote owner.
#[derive(Debug, Default)]
pub struct StateHistory {
    versions: HashMap<String, u64>,
}

impl StateHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest version accepted from a peer, if any.
    pub fn get(&self, peer_id: &str) -> Option<u64> {
        self.versions.get(peer_id).copied()
    }

    /// Record an accepted version.
    pub fn record(&mut self, peer_id: &str, version: u64) {
        self.versions.insert(peer_id.to_string(), version);
    }

    /// Highest version accepted from any owner; 0 when none recorded.
    pub fn max_version(&self) -> u64 {
        self.versions.values().copied().max().unwrap_or(0)
    }

    /// Drop everything. Used on engine shutdown.
    pub fn clear(&mut self) {
        self.versions.clear();
    }
}

/// Result of applying an incoming sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Version was not newer than the last accepted one; no effect.
    Stale,
    /// Merge applied; flags say which collections actually changed.
    Applied {
        /// Channel list changed
        channels: bool,
        /// Peer-location map changed
        locations: bool,
        /// Annotation set changed
        annotations: bool,
    },
}

impl SyncOutcome {
    /// Whether the message had any effect.
    pub fn applied(&self) -> bool {
        matches!(self, SyncOutcome::Applied { .. })
    }
}

/// The locally held copy of the mesh's shared state.
#[derive(Debug)]
pub struct SharedState {
    /// Owner ID stamped on outgoing versions
    local_peer_id: String,
    /// Version counter for the locally-owned state
    version: u64,
    channels: Vec<Channel>,
    peer_locations: HashMap<String, LocationUpdate>,
    annotations: HashMap<String, Annotation>,
}

impl SharedState {
    /// Create empty state owned by the given peer ID.
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            version: 0,
            channels: Vec::new(),
            peer_locations: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    /// Owner ID stamped on outgoing versions.
    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Current local version counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bump the local version for an outgoing sync and return its stamp.
    pub fn next_version(&mut self, now: u64) -> StateVersion {
        self.version += 1;
        StateVersion {
            version: self.version,
            timestamp_ms: now,
            peer_id: self.local_peer_id.clone(),
        }
    }

    /// Build a full sync message at the next version.
    pub fn full_sync_message(&mut self, now: u64) -> StateSyncMessage {
        let version = self.next_version(now);
        StateSyncMessage::full(
            version,
            self.channels.clone(),
            self.peer_locations.clone(),
            self.annotations.values().cloned().collect(),
        )
    }

    /// Add a channel or replace the one with the same ID.
    pub fn upsert_channel(&mut self, channel: Channel) {
        match self.channels.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => *existing = channel,
            None => self.channels.push(channel),
        }
    }

    /// Record a peer's position, unconditionally replacing the old one.
    pub fn set_peer_location(&mut self, location: LocationUpdate) {
        self.peer_locations
            .insert(location.peer_id.clone(), location);
    }

    /// Merge one annotation by ID with strict last-writer-wins on the
    /// timestamp. Returns `true` when the annotation was stored.
    pub fn merge_annotation(&mut self, annotation: Annotation) -> bool {
        match self.annotations.get(&annotation.id) {
            Some(existing) if existing.timestamp_ms >= annotation.timestamp_ms => false,
            _ => {
                self.annotations.insert(annotation.id.clone(), annotation);
                true
            }
        }
    }

    /// Current channel list.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Current peer-location map.
    pub fn peer_locations(&self) -> &HashMap<String, LocationUpdate> {
        &self.peer_locations
    }

    /// Current annotations.
    pub fn annotations(&self) -> Vec<Annotation> {
        self.annotations.values().cloned().collect()
    }

    /// Look up one annotation by ID.
    pub fn annotation(&self, id: &str) -> Option<&Annotation> {
        self.annotations.get(id)
    }

    /// Apply an incoming sync message.
    ///
    /// The owner's recorded version gates acceptance; a version less than
    /// or equal to the recorded one is discarded silently (expected in a
    /// gossiping mesh, not an error).
    pub fn apply_sync(&mut self, msg: &StateSyncMessage, history: &mut StateHistory) -> SyncOutcome {
        let owner = &msg.version.peer_id;
        if let Some(recorded) = history.get(owner) {
            if msg.version.version <= recorded {
                return SyncOutcome::Stale;
            }
        }
        history.record(owner, msg.version.version);

        if msg.partial_update {
            self.merge_partial(msg)
        } else {
            self.replace_full(msg)
        }
    }

    fn replace_full(&mut self, msg: &StateSyncMessage) -> SyncOutcome {
        self.channels = msg.channels.clone();
        self.peer_locations = msg.peer_locations.clone();
        self.annotations = msg
            .annotations
            .iter()
            .cloned()
            .map(|a| (a.id.clone(), a))
            .collect();

        SyncOutcome::Applied {
            channels: true,
            locations: true,
            annotations: true,
        }
    }

    fn merge_partial(&mut self, msg: &StateSyncMessage) -> SyncOutcome {
        let mut channels = false;
        let mut locations = false;
        let mut annotations = false;

        if msg.update_fields.contains(FIELD_CHANNELS) {
            for channel in &msg.channels {
                self.upsert_channel(channel.clone());
            }
            channels = !msg.channels.is_empty();
        }

        if msg.update_fields.contains(FIELD_PEER_LOCATIONS) {
            for location in msg.peer_locations.values() {
                self.set_peer_location(location.clone());
            }
            locations = !msg.peer_locations.is_empty();
        }

        if msg.update_fields.contains(FIELD_ANNOTATIONS) {
            for annotation in &msg.annotations {
                annotations |= self.merge_annotation(annotation.clone());
            }
        }

        SyncOutcome::Applied {
            channels,
            locations,
            annotations,
        }
    }

    /// Drop all shared collections. Used on engine shutdown.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.peer_locations.clear();
        self.annotations.clear();
    }
}
