//! # Taskbridge
//!
//! A bridge that lets a host process hand tasks to agents living in a
//! separate worker runtime.
//!
//! The bridge listens on a Unix socket for a single peer. The peer registers
//! agents and their capabilities; the host routes tasks by capability, and
//! each task goes to the least-loaded capable agent. Responses, expiries and
//! connection loss are published as [`BridgeEvent`]s.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use taskbridge_proto as proto;

/// Error types for the bridge
pub mod error;

/// Bridge configuration
pub mod config;

/// Capability registry
pub mod registry;

/// Load tracking and in-flight task bookkeeping
pub mod dispatcher;

/// Dispatch statistics
pub mod stats;

/// Heartbeat and reconnect accounting
pub mod liveness;

/// Events published to subscribers
pub mod events;

/// Socket server and public API
pub mod bridge;

mod router;
mod state;

pub use bridge::TaskBridge;
pub use config::{BridgeConfig, PeerPolicy};
pub use dispatcher::{Task, TaskAssignment, TaskState};
pub use error::BridgeError;
pub use events::{BridgeEvent, EventBus, TaskCompletion};
pub use registry::{AgentRecord, MatchPolicy};
pub use state::{BridgeStatus, PeerInfo, ServerState};
pub use stats::TaskStats;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
