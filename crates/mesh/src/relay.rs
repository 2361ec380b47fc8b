//! Inbound audio buffering.
//!
//! Audio packets are not reliability-wrapped; they land in a per-channel
//! bounded buffer drained by the external playback collaborator. When a
//! buffer overflows, the oldest frame is dropped: audio tolerates loss,
//! not latency.

use std::collections::{HashMap, VecDeque};

/// One received audio frame.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Channel the frame belongs to
    pub channel_id: String,
    /// Peer that sent the frame
    pub peer_id: String,
    /// Raw codec bytes, untouched by the mesh
    pub data: Vec<u8>,
    /// Arrival time (Unix epoch milliseconds)
    pub received_at: u64,
}

/// Per-channel bounded FIFO buffers of received audio frames.
#[derive(Debug)]
pub struct AudioBuffers {
    buffers: HashMap<String, VecDeque<AudioFrame>>,
    capacity: usize,
}

impl AudioBuffers {
    /// Create buffers retaining at most `capacity` frames per channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a frame to its channel, evicting the oldest on overflow.
    pub fn push(&mut self, frame: AudioFrame) {
        let buffer = self.buffers.entry(frame.channel_id.clone()).or_default();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    /// Take every buffered frame for a channel, oldest first.
    pub fn drain(&mut self, channel_id: &str) -> Vec<AudioFrame> {
        self.buffers
            .get_mut(channel_id)
            .map(|buffer| buffer.drain(..).collect())
            .unwrap_or_default()
    }

    /// Frames currently buffered for a channel.
    pub fn len(&self, channel_id: &str) -> usize {
        self.buffers.get(channel_id).map_or(0, VecDeque::len)
    }

    /// Whether a channel has no buffered frames.
    pub fn is_empty(&self, channel_id: &str) -> bool {
        self.len(channel_id) == 0
    }

    /// Drop all buffers. Used on engine shutdown.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
