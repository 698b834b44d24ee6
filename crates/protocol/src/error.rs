//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way an inbound frame can be rejected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or not a JSON object.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame has no string `type` field.
    #[error("message is missing a string \"type\" field")]
    MissingType,

    /// The `type` field names a message this server does not understand.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The message type is known but its fields are missing or mistyped.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Terminal dimensions must both be non-zero.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidDimensions {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },

    /// Failed to serialize an outbound message.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() {
            ProtocolError::Malformed(err.to_string())
        } else if err.is_data() {
            ProtocolError::InvalidMessage(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
