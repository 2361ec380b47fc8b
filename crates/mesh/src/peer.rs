//! Peer registry and liveness tracking.
//!
//! The registry is the single owner of [`PeerRecord`]s. It lives behind a
//! lock inside the engine; other components only ever see cloned
//! snapshots, never the underlying map.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use fieldlink_proto::DiscoveryAnnounce;

use crate::config::MeshConfig;

/// Unique identifier for a node in the mesh, derived from its discovery
/// address as `ip:port`.
pub type PeerId = String;

/// Derive a peer ID from a discovery socket address.
pub fn peer_id_for(addr: &SocketAddr) -> PeerId {
    format!("{}:{}", addr.ip(), addr.port())
}

/// Peer count above which the mesh is considered crowded and announces
/// slow down to the maximum interval.
const CROWDED_PEER_COUNT: usize = 10;

/// Average link quality below which announces speed up to recover peers.
const DEGRADED_QUALITY: f64 = 0.5;

/// A live peer as observed from discovery traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer identifier (`ip:discovery_port`)
    pub peer_id: PeerId,
    /// Discovery address the peer announces from
    pub addr: SocketAddr,
    /// Last time any discovery packet arrived from this peer
    /// (Unix epoch milliseconds)
    pub last_seen: u64,
    /// Advertised display name
    pub nickname: Option<String>,
    /// Advertised capability set
    pub capabilities: HashSet<String>,
    /// Network quality the peer reported for its own links, in [0, 1]
    pub quality: f64,
    /// Highest state version the peer advertised
    pub last_state_version: u64,
}

/// Registry of all live peers plus the advertised-topology map.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Live peers indexed by peer ID
    peers: HashMap<PeerId, PeerRecord>,
    /// Peer ID -> set of peer IDs it claims to know (diagnostics only,
    /// never used for routing)
    topology: HashMap<PeerId, HashSet<PeerId>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer from a received discovery announcement.
    /// Returns the updated record.
    pub fn upsert_from_announce(
        &mut self,
        addr: SocketAddr,
        announce: &DiscoveryAnnounce,
        now: u64,
    ) -> PeerRecord {
        let peer_id = peer_id_for(&addr);
        let record = PeerRecord {
            peer_id: peer_id.clone(),
            addr,
            last_seen: now,
            nickname: Some(announce.nickname.clone()),
            capabilities: announce.capabilities.clone(),
            quality: announce.network_quality,
            last_state_version: announce.last_state_version,
        };

        self.topology
            .insert(peer_id.clone(), announce.known_peers.clone());
        self.peers.insert(peer_id, record.clone());
        record
    }

    /// Insert a record directly, bypassing announce handling. Used when
    /// seeding from the durable cache at startup.
    pub fn insert(&mut self, record: PeerRecord) {
        self.peers.insert(record.peer_id.clone(), record);
    }

    /// Refresh only the last-seen timestamp, for non-announce traffic.
    pub fn touch(&mut self, peer_id: &str, now: u64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = now;
        }
    }

    /// Get a peer by ID.
    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Number of live peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the registry has no live peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Clone all live records.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    /// IDs of all live peers.
    pub fn known_ids(&self) -> HashSet<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// The peer set a given peer last advertised, if it is still live.
    pub fn advertised_peers(&self, peer_id: &str) -> Option<&HashSet<PeerId>> {
        self.topology.get(peer_id)
    }

    /// Remove every peer whose silence exceeds its own adaptive timeout.
    /// Returns the removed records.
    pub fn expire<F>(&mut self, now: u64, timeout_for: F) -> Vec<PeerRecord>
    where
        F: Fn(&str) -> Duration,
    {
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(id, peer)| {
                now.saturating_sub(peer.last_seen) > timeout_for(id).as_millis() as u64
            })
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| {
                self.topology.remove(id);
                self.peers.remove(id)
            })
            .collect()
    }

    /// Remove everything. Used on engine shutdown.
    pub fn clear(&mut self) {
        self.peers.clear();
        self.topology.clear();
    }

    /// Current self-announce interval given the mesh's condition.
    ///
    /// No peers or degraded links announce fast to find or recover peers;
    /// a crowded mesh announces slowly to cut chatter.
    pub fn adaptive_discovery_interval(&self, avg_quality: f64, config: &MeshConfig) -> Duration {
        let ms = if self.peers.is_empty() || avg_quality < DEGRADED_QUALITY {
            config.discovery_interval_min_ms
        } else if self.peers.len() > CROWDED_PEER_COUNT {
            config.discovery_interval_max_ms
        } else {
            config.discovery_interval_default_ms
        };
        Duration::from_millis(ms)
    }
}

/// Get current timestamp in milliseconds.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
