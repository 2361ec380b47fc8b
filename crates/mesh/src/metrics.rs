//! Per-peer connection metrics and adaptive timeouts.
//!
//! Every packet carrying a sender timestamp feeds a latency sample;
//! the reliability layer feeds loss ratios. Smoothed values drive a
//! composite quality score and a per-peer liveness timeout.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// EWMA smoothing factor for latency and jitter.
const SMOOTHING: f64 = 0.1;

/// Smoothed link metrics for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Smoothed one-way latency estimate in milliseconds
    pub latency_ms: f64,
    /// Smoothed absolute latency delta, used as a jitter proxy
    pub jitter_ms: f64,
    /// Fraction of recent reliable sends that never got an ack
    pub packet_loss: f64,
    /// Composite quality score in [0, 1]
    pub quality: f64,
    /// Last update time (Unix epoch milliseconds)
    pub last_update: u64,
}

/// Metrics for all peers, keyed by peer ID.
#[derive(Debug)]
pub struct MetricsTable {
    metrics: HashMap<String, ConnectionMetrics>,
    /// Lower clamp on the adaptive timeout, milliseconds
    min_timeout_ms: u64,
    /// Upper clamp on the adaptive timeout; also normalizes latency and
    /// jitter in the quality score
    max_timeout_ms: u64,
}

impl MetricsTable {
    /// Create a table with the given timeout clamp.
    pub fn new(min_timeout_ms: u64, max_timeout_ms: u64) -> Self {
        Self {
            metrics: HashMap::new(),
            min_timeout_ms,
            max_timeout_ms,
        }
    }

    /// Feed one latency sample (sender clock to arrival, milliseconds).
    ///
    /// Clock skew can make samples negative; those are floored at zero so
    /// a skewed peer reads as a fast link rather than poisoning the EWMA.
    pub fn record_latency(&mut self, peer_id: &str, sample_ms: f64, now: u64) {
        let sample = sample_ms.max(0.0);
        let max_timeout = self.max_timeout_ms;

        let entry = self
            .metrics
            .entry(peer_id.to_string())
            .or_insert(ConnectionMetrics {
                latency_ms: sample,
                jitter_ms: 0.0,
                packet_loss: 0.0,
                quality: 1.0,
                last_update: now,
            });

        let delta = (sample - entry.latency_ms).abs();
        entry.latency_ms = entry.latency_ms + SMOOTHING * (sample - entry.latency_ms);
        entry.jitter_ms = entry.jitter_ms + SMOOTHING * (delta - entry.jitter_ms);
        entry.last_update = now;
        entry.quality = Self::quality_of(entry, max_timeout);
    }

    /// Feed the current loss estimate for a peer.
    pub fn record_loss(&mut self, peer_id: &str, loss: f64, now: u64) {
        let max_timeout = self.max_timeout_ms;
        let entry = self
            .metrics
            .entry(peer_id.to_string())
            .or_insert(ConnectionMetrics {
                latency_ms: 0.0,
                jitter_ms: 0.0,
                packet_loss: 0.0,
                quality: 1.0,
                last_update: now,
            });

        entry.packet_loss = loss.clamp(0.0, 1.0);
        entry.last_update = now;
        entry.quality = Self::quality_of(entry, max_timeout);
    }

    fn quality_of(metrics: &ConnectionMetrics, max_timeout_ms: u64) -> f64 {
        let max = max_timeout_ms as f64;
        let score = (1.0 - metrics.packet_loss)
            * (1.0 - metrics.latency_ms / max)
            * (1.0 - metrics.jitter_ms / max);
        score.clamp(0.0, 1.0)
    }

    /// Liveness timeout for one peer.
    ///
    /// Peers with no samples yet get the maximum timeout so a fresh peer
    /// is never expired on another link's numbers.
    pub fn timeout_for(&self, peer_id: &str) -> Duration {
        let ms = match self.metrics.get(peer_id) {
            Some(m) => {
                let raw = (m.latency_ms + 2.0 * m.jitter_ms) * (1.0 + 2.0 * m.packet_loss);
                (raw as u64).clamp(self.min_timeout_ms, self.max_timeout_ms)
            }
            None => self.max_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Snapshot of one peer's metrics.
    pub fn get(&self, peer_id: &str) -> Option<&ConnectionMetrics> {
        self.metrics.get(peer_id)
    }

    /// Average quality across all tracked peers; 1.0 when none tracked.
    pub fn average_quality(&self) -> f64 {
        if self.metrics.is_empty() {
            return 1.0;
        }
        let sum: f64 = self.metrics.values().map(|m| m.quality).sum();
        sum / self.metrics.len() as f64
    }

    /// Drop metrics for an expired peer.
    pub fn remove(&mut self, peer_id: &str) {
        self.metrics.remove(peer_id);
    }

    /// Drop everything. Used on engine shutdown.
    pub fn clear(&mut self) {
        self.metrics.clear();
    }
}
