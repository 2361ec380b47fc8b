//! Error types for FieldLink mesh operations.
//!
//! Nothing in this subsystem is fatal to the process: listener loops log
//! transient failures and continue, and the engine degrades (stale peers,
//! missed updates) rather than halting.

use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Wire framing or payload parse errors
    #[error("Protocol error: {0}")]
    Proto(#[from] fieldlink_proto::ProtoError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Peer cache database errors
    #[error("Peer cache error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
