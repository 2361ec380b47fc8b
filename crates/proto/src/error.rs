//! Error types for wire format encoding and decoding.

use thiserror::Error;

/// Errors that can occur while framing or parsing packets.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// No header/payload boundary marker found in the datagram
    #[error("malformed frame: no header boundary found in {len} bytes")]
    MissingBoundary {
        /// Length of the offending datagram
        len: usize,
    },

    /// Header bytes were not valid JSON
    #[error("malformed header: {0}")]
    Header(#[from] serde_json::Error),

    /// Payload could not be parsed into the expected message type
    #[error("malformed {kind} payload: {source}")]
    Payload {
        /// Packet type the payload belonged to
        kind: &'static str,
        /// Underlying parse failure
        source: serde_json::Error,
    },
}
