//! # Taskbridge Protocol
//!
//! Message envelope, payload contracts, and the length-prefixed frame codec
//! spoken between the task bridge and its worker-runtime peer.

#![warn(missing_docs)]

/// Message envelope and message types
pub mod message;

/// Typed views over message payloads
pub mod payload;

/// Length-prefixed frame codec
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{Decoded, FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::{Message, MessageType, Payload};
pub use payload::{
    AgentQuery, AgentRegistration, Handshake, HandshakeAck, QueryKind, StatusSnapshot,
    TaskRequest, TaskResponse,
};
