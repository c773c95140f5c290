//! Error types for the task bridge

use std::time::Duration;
use taskbridge_proto::ProtocolError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Socket could not be prepared, bound, or listened on
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bridge was already initialized
    #[error("Bridge already initialized")]
    AlreadyInitialized,

    /// No peer is connected, so nothing can be sent
    #[error("No peer connected")]
    NotConnected,

    /// The peer went away while a call was waiting on it
    #[error("Peer disconnected")]
    Disconnected,

    /// No registered agent offers the requested capabilities
    #[error("No capable agent for capabilities {capabilities:?}")]
    NoCapableAgent {
        /// Capabilities that were requested
        capabilities: Vec<String>,
    },

    /// A task with this ID is already in flight
    #[error("Task already in flight: {0}")]
    DuplicateTask(String),

    /// The task was swept before a response arrived
    #[error("Task expired without a response: {0}")]
    TaskExpired(String),

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
