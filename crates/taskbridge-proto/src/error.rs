//! Error types for protocol operations

use std::io;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// A frame body could not be decoded into a message
    #[error("Decode error: {0}")]
    Decode(String),

    /// Frame exceeds the configured size limit
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Stream ended in the middle of a frame
    #[error("Stream ended with {buffered} bytes of an incomplete frame")]
    Truncated {
        /// Bytes left in the reassembly buffer
        buffered: usize,
    },

    /// Payload does not match the contract for its message type
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Message type whose payload was rejected
        kind: String,
        /// What was wrong with it
        reason: String,
    },

    /// Underlying stream error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
