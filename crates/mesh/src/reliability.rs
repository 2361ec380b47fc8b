//! Duplicate suppression, ack tracking, and retry bookkeeping.
//!
//! Every inbound packet passes the duplicate filter before any other
//! processing. Reliable sends park their raw bytes in the pending-ack
//! table; the engine's retry task resends until an ack arrives or the
//! attempt budget runs out. Delivery outcomes feed the packet-loss
//! estimate in the metrics table.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Seen-sequence window size per sender. When exceeded the window is
/// reset, trading a sliver of duplicate protection for bounded memory.
const MAX_SEEN_PER_SENDER: usize = 4096;

/// Monotonic sequence number source for outgoing packets.
///
/// Starts at a random offset so a restarted node does not replay
/// sequence numbers still sitting in peers' duplicate windows.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    /// Create a counter starting at a random offset.
    pub fn new() -> Self {
        let start: u32 = rand::random();
        Self {
            next: AtomicU64::new(start as u64),
        }
    }

    /// Take the next sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sender duplicate suppression.
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    seen: HashMap<String, HashSet<u64>>,
}

impl DuplicateFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a (sender, sequence) pair. Returns `true` when the packet
    /// is new and should be processed, `false` when it is a repeat.
    pub fn check_and_record(&mut self, sender: &str, sequence: u64) -> bool {
        let window = self.seen.entry(sender.to_string()).or_default();
        if window.len() >= MAX_SEEN_PER_SENDER {
            window.clear();
        }
        window.insert(sequence)
    }

    /// Drop the window for an expired peer.
    pub fn remove(&mut self, sender: &str) {
        self.seen.remove(sender);
    }

    /// Drop everything. Used on engine shutdown.
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// An outgoing reliable packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingAck {
    /// Peer the packet was addressed to
    pub peer_id: String,
    /// Destination socket address for resends
    pub target: SocketAddr,
    /// Encoded frame bytes, resent verbatim
    pub bytes: Vec<u8>,
    /// When the reliable send was issued (Unix epoch milliseconds)
    pub created_at: u64,
}

/// Pending-ack table plus recent per-peer delivery outcomes.
#[derive(Debug, Default)]
pub struct PendingAcks {
    entries: HashMap<u64, PendingAck>,
    /// Peer ID -> (completion time, acked) for recent reliable sends
    outcomes: HashMap<String, VecDeque<(u64, bool)>>,
}

impl PendingAcks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an outgoing reliable packet until its ack arrives.
    pub fn register(&mut self, sequence: u64, entry: PendingAck) {
        self.entries.insert(sequence, entry);
    }

    /// Resolve a received ack. Returns the completed entry, or `None` for
    /// acks that match nothing (late or duplicate acks).
    pub fn acknowledge(&mut self, sequence: u64, now: u64) -> Option<PendingAck> {
        let entry = self.entries.remove(&sequence)?;
        self.push_outcome(&entry.peer_id, now, true);
        Some(entry)
    }

    /// Give up on a reliable send after the retry budget is exhausted.
    pub fn give_up(&mut self, sequence: u64, now: u64) -> Option<PendingAck> {
        let entry = self.entries.remove(&sequence)?;
        self.push_outcome(&entry.peer_id, now, false);
        Some(entry)
    }

    /// Whether a sequence is still awaiting its ack.
    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// Number of packets still awaiting acks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no packets are awaiting acks.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fraction of a peer's reliable sends within the window that never
    /// got an ack. Reports 0.0 when the window holds no outcomes.
    pub fn loss_ratio(&mut self, peer_id: &str, window_ms: u64, now: u64) -> f64 {
        let Some(outcomes) = self.outcomes.get_mut(peer_id) else {
            return 0.0;
        };

        let cutoff = now.saturating_sub(window_ms);
        while outcomes.front().is_some_and(|(at, _)| *at < cutoff) {
            outcomes.pop_front();
        }

        if outcomes.is_empty() {
            return 0.0;
        }
        let lost = outcomes.iter().filter(|(_, acked)| !acked).count();
        lost as f64 / outcomes.len() as f64
    }

    /// Drop everything. Used on engine shutdown.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.outcomes.clear();
    }

    fn push_outcome(&mut self, peer_id: &str, now: u64, acked: bool) {
        self.outcomes
            .entry(peer_id.to_string())
            .or_default()
            .push_back((now, acked));
    }
}
