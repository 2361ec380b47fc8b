//! Durable peer cache.
//!
//! A subset of each peer record is persisted across restarts so a node
//! rejoining the mesh can seed its registry instead of starting cold.
//! Loaded once at startup, written on every discovery update.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};

use crate::peer::PeerRecord;

/// Durable subset of a [`PeerRecord`], survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPeerRecord {
    /// Peer identifier (`ip:discovery_port`)
    pub peer_id: String,
    /// Discovery address as text
    pub addr: String,
    /// Advertised display name
    pub nickname: Option<String>,
    /// Advertised capability set
    pub capabilities: HashSet<String>,
    /// Last known network quality in [0, 1]
    pub quality: f64,
    /// Last advertised state version
    pub last_state_version: u64,
    /// Last time the peer was seen (Unix epoch milliseconds)
    pub last_seen: u64,
}

impl From<&PeerRecord> for CachedPeerRecord {
    fn from(peer: &PeerRecord) -> Self {
        Self {
            peer_id: peer.peer_id.clone(),
            addr: peer.addr.to_string(),
            nickname: peer.nickname.clone(),
            capabilities: peer.capabilities.clone(),
            quality: peer.quality,
            last_state_version: peer.last_state_version,
            last_seen: peer.last_seen,
        }
    }
}

/// SQLite-backed store for cached peer records.
#[derive(Debug)]
pub struct PeerCache {
    db: Connection,
}

impl PeerCache {
    /// Open (or create) the cache at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let db = Connection::open(path)?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS peer_cache (
                peer_id TEXT PRIMARY KEY,
                addr TEXT NOT NULL,
                nickname TEXT,
                capabilities TEXT NOT NULL,
                quality REAL NOT NULL,
                state_version INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_peer_last_seen ON peer_cache(last_seen)",
            [],
        )?;

        Ok(Self { db })
    }

    /// Insert or update one cached record.
    pub fn upsert(&mut self, record: &CachedPeerRecord) -> SqliteResult<()> {
        let capabilities =
            serde_json::to_string(&record.capabilities).unwrap_or_else(|_| "[]".to_string());

        self.db.execute(
            "INSERT OR REPLACE INTO peer_cache
                (peer_id, addr, nickname, capabilities, quality, state_version, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.peer_id,
                record.addr,
                record.nickname,
                capabilities,
                record.quality,
                record.last_state_version as i64,
                record.last_seen as i64,
            ],
        )?;
        Ok(())
    }

    /// Write a whole registry snapshot. Used by the periodic flush and on
    /// shutdown.
    pub fn flush(&mut self, peers: &[PeerRecord]) -> SqliteResult<()> {
        for peer in peers {
            self.upsert(&CachedPeerRecord::from(peer))?;
        }
        Ok(())
    }

    /// Load every cached record, newest first.
    pub fn load_all(&self) -> SqliteResult<Vec<CachedPeerRecord>> {
        let mut stmt = self.db.prepare(
            "SELECT peer_id, addr, nickname, capabilities, quality, state_version, last_seen
             FROM peer_cache ORDER BY last_seen DESC",
        )?;

        let records = stmt
            .query_map([], |row| {
                let capabilities_json: String = row.get(3)?;
                Ok(CachedPeerRecord {
                    peer_id: row.get(0)?,
                    addr: row.get(1)?,
                    nickname: row.get(2)?,
                    capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
                    quality: row.get(4)?,
                    last_state_version: row.get::<_, i64>(5)? as u64,
                    last_seen: row.get::<_, i64>(6)? as u64,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Number of cached records.
    pub fn len(&self) -> SqliteResult<usize> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM peer_cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
