//! FieldLink Proto - Wire Format for the Tactical Mesh
//!
//! Defines the framed packet format exchanged between mesh nodes over UDP
//! and the typed payloads carried inside those frames.
//!
//! # Frame Layout
//!
//! Every packet is a [`PacketHeader`] serialized as JSON, a single `\n`
//! terminator byte, then the raw payload. JSON never contains a literal
//! newline, so the first `\n` is an unambiguous boundary. Payloads are
//! opaque bytes: most packet types carry JSON payloads, audio carries raw
//! codec frames.
//!
//! # Example
//!
//! ```rust
//! use fieldlink_proto::{Frame, PacketHeader, PacketType};
//!
//! let header = PacketHeader::new(7, PacketType::Location, 1_700_000_000_000);
//! let bytes = Frame::encode(&header, b"{\"lat\":1.0}").unwrap();
//! let (decoded, payload) = Frame::decode(&bytes).unwrap();
//! assert_eq!(decoded.sequence, 7);
//! assert_eq!(payload, b"{\"lat\":1.0}");
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod message;

pub use error::ProtoError;
pub use frame::{Frame, PacketHeader, PacketType};
pub use message::{
    Annotation, AnnotationMessage, Channel, DiscoveryAnnounce, LocationUpdate, StateSyncMessage,
    StateVersion, FIELD_ANNOTATIONS, FIELD_CHANNELS, FIELD_PEER_LOCATIONS,
};
