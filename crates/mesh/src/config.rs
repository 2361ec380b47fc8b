//! Configuration for a FieldLink mesh node.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Largest offset added to a base port for a derived data port.
const MAX_PORT_OFFSET: u16 = 10;

/// Highest base port that leaves room for every derived data port.
pub const MAX_BASE_PORT: u16 = u16::MAX - MAX_PORT_OFFSET;

/// Tunable parameters for the mesh engine.
///
/// All ports except the annotation port are derived from `base_port` by
/// fixed offsets, so a whole fleet is configured with a single number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Display name advertised in discovery announcements
    pub nickname: String,
    /// Capability set advertised in discovery announcements
    pub capabilities: HashSet<String>,
    /// Base UDP port `P`: discovery `P`, location `P+1`, audio `P+2`,
    /// state sync `P+10`
    pub base_port: u16,
    /// Fixed port for annotation traffic, shared fleet-wide
    pub annotation_port: u16,
    /// Local address to scope sockets to; `None` binds all interfaces
    pub bind_addr: Option<IpAddr>,
    /// Address used for discovery and data broadcasts
    pub broadcast_addr: Ipv4Addr,
    /// Multicast groups to join and announce on, if any
    pub multicast_groups: Vec<Ipv4Addr>,
    /// Discovery addresses of known nodes, announced to directly
    /// (bootstrap for networks where broadcast does not reach)
    pub seed_peers: Vec<SocketAddr>,
    /// Fastest self-announce cadence (no peers / poor quality)
    pub discovery_interval_min_ms: u64,
    /// Normal self-announce cadence
    pub discovery_interval_default_ms: u64,
    /// Slowest self-announce cadence (crowded mesh)
    pub discovery_interval_max_ms: u64,
    /// Lower clamp on the adaptive peer timeout
    pub peer_timeout_min_ms: u64,
    /// Upper clamp on the adaptive peer timeout; also the normalization
    /// bound in the quality score
    pub peer_timeout_max_ms: u64,
    /// Attempts per reliable send before giving up
    pub max_retries: u32,
    /// Delay between reliable-send attempts
    pub retry_delay_ms: u64,
    /// Cadence of keep-alive pings to known peers
    pub ping_interval_ms: u64,
    /// Cadence of the periodic full state rebroadcast
    pub rebroadcast_interval_ms: u64,
    /// Cadence of periodic peer-cache flushes
    pub cache_flush_interval_ms: u64,
    /// SQLite path for the durable peer cache (":memory:" for none)
    pub cache_path: String,
    /// Frames retained per channel in the inbound audio buffer
    pub audio_buffer_frames: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nickname: "fieldlink-node".to_string(),
            capabilities: HashSet::new(),
            base_port: 47700,
            annotation_port: 47731,
            bind_addr: None,
            broadcast_addr: Ipv4Addr::BROADCAST,
            multicast_groups: Vec::new(),
            seed_peers: Vec::new(),
            discovery_interval_min_ms: 2_000,
            discovery_interval_default_ms: 5_000,
            discovery_interval_max_ms: 15_000,
            peer_timeout_min_ms: 5_000,
            peer_timeout_max_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            ping_interval_ms: 5_000,
            rebroadcast_interval_ms: 30_000,
            cache_flush_interval_ms: 60_000,
            cache_path: "fieldlink_peers.db".to_string(),
            audio_buffer_frames: 64,
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every configured base port leaves room for the derived
    /// data ports. The engine refuses to start on a config that fails.
    pub fn validate(&self) -> MeshResult<()> {
        if self.base_port > MAX_BASE_PORT {
            return Err(MeshError::Config(format!(
                "base_port {} leaves no room for derived ports (max {MAX_BASE_PORT})",
                self.base_port
            )));
        }
        for seed in &self.seed_peers {
            if seed.port() > MAX_BASE_PORT {
                return Err(MeshError::Config(format!(
                    "seed peer {seed} has a base port above {MAX_BASE_PORT}"
                )));
            }
        }
        Ok(())
    }

    /// Discovery send/receive port.
    pub fn discovery_port(&self) -> u16 {
        self.base_port
    }

    /// Location traffic port.
    pub fn location_port(&self) -> u16 {
        self.base_port.saturating_add(1)
    }

    /// Audio traffic port.
    pub fn audio_port(&self) -> u16 {
        self.base_port.saturating_add(2)
    }

    /// State-sync traffic port.
    pub fn state_sync_port(&self) -> u16 {
        self.base_port.saturating_add(10)
    }

    /// Delay between reliable-send attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Keep-alive ping cadence.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Full state rebroadcast cadence.
    pub fn rebroadcast_interval(&self) -> Duration {
        Duration::from_millis(self.rebroadcast_interval_ms)
    }

    /// Peer-cache flush cadence.
    pub fn cache_flush_interval(&self) -> Duration {
        Duration::from_millis(self.cache_flush_interval_ms)
    }
}
