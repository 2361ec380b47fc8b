//! Packet framing - header serialization and payload splitting.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Byte separating the JSON header from the raw payload.
const HEADER_TERMINATOR: u8 = b'\n';

/// Kind of packet carried in a frame. Each type is served on its own UDP
/// port, but the type is carried in the header as well so every listener
/// can dispatch through the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    /// Self-announcement / liveness ping
    Discovery,
    /// Position report
    Location,
    /// Map annotation
    Annotation,
    /// Channel-scoped voice data
    Audio,
    /// Full or partial shared-state snapshot
    StateSync,
    /// Acknowledgment of a previously received sequence number
    Ack,
}

/// Header prefixed to every packet on the wire.
///
/// Sequence numbers are monotonic per sender and unique within the
/// duplicate-detection window. Timestamps are sender-clock milliseconds
/// used only for latency estimation, never for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Monotonic per-sender sequence number
    pub sequence: u64,
    /// Packet type for dispatch
    pub packet_type: PacketType,
    /// Sender clock at send time (Unix epoch milliseconds)
    pub timestamp_ms: u64,
    /// Channel the payload belongs to (audio only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl PacketHeader {
    /// Create a header without a channel identifier.
    pub fn new(sequence: u64, packet_type: PacketType, timestamp_ms: u64) -> Self {
        Self {
            sequence,
            packet_type,
            timestamp_ms,
            channel_id: None,
        }
    }

    /// Create a header scoped to a channel.
    pub fn with_channel(
        sequence: u64,
        packet_type: PacketType,
        timestamp_ms: u64,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            packet_type,
            timestamp_ms,
            channel_id: Some(channel_id.into()),
        }
    }

    /// Build the header-only ack frame for this packet.
    pub fn ack(&self, timestamp_ms: u64) -> PacketHeader {
        PacketHeader::new(self.sequence, PacketType::Ack, timestamp_ms)
    }
}

/// Encoder/decoder for the `header || payload` frame layout.
pub struct Frame;

impl Frame {
    /// Serialize a header and payload into a single datagram.
    pub fn encode(header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
        let header_bytes = serde_json::to_vec(header)?;
        let mut out = Vec::with_capacity(header_bytes.len() + 1 + payload.len());
        out.extend_from_slice(&header_bytes);
        out.push(HEADER_TERMINATOR);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Split a datagram into its header and raw payload.
    pub fn decode(bytes: &[u8]) -> Result<(PacketHeader, &[u8]), ProtoError> {
        let boundary = bytes
            .iter()
            .position(|b| *b == HEADER_TERMINATOR)
            .ok_or(ProtoError::MissingBoundary { len: bytes.len() })?;

        let header: PacketHeader = serde_json::from_slice(&bytes[..boundary])?;
        Ok((header, &bytes[boundary + 1..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let header = PacketHeader::new(42, PacketType::Discovery, 1000);
        let bytes = Frame::encode(&header, b"payload").unwrap();

        let (decoded, payload) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_binary_payload_survives() {
        // Audio payloads are raw bytes and may contain the terminator byte.
        let header = PacketHeader::with_channel(1, PacketType::Audio, 500, "alpha");
        let payload: Vec<u8> = (0u8..=255).cycle().take(9000).collect();

        let bytes = Frame::encode(&header, &payload).unwrap();
        let (decoded, got) = Frame::decode(&bytes).unwrap();

        assert_eq!(decoded.channel_id.as_deref(), Some("alpha"));
        assert_eq!(got, &payload[..]);
    }

    #[test]
    fn test_decode_without_boundary_fails() {
        let result = Frame::decode(b"\x01\x02\x03");
        match result {
            Err(ProtoError::MissingBoundary { len }) => assert_eq!(len, 3),
            other => panic!("Expected MissingBoundary, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_header_fails() {
        let result = Frame::decode(b"not json\npayload");
        assert!(matches!(result, Err(ProtoError::Header(_))));
    }

    #[test]
    fn test_empty_payload() {
        let header = PacketHeader::new(9, PacketType::Ack, 0);
        let bytes = Frame::encode(&header, &[]).unwrap();

        let (decoded, payload) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Ack);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_ack_echoes_sequence() {
        let header = PacketHeader::new(77, PacketType::StateSync, 123);
        let ack = header.ack(456);

        assert_eq!(ack.sequence, 77);
        assert_eq!(ack.packet_type, PacketType::Ack);
        assert_eq!(ack.timestamp_ms, 456);
        assert!(ack.channel_id.is_none());
    }
}
