//! Typed views over message payloads
//!
//! The envelope carries an opaque map; these structs are the contract each
//! message type's payload must satisfy. Decode with [`Message::payload_as`]
//! and encode with [`to_payload`].
//!
//! [`Message::payload_as`]: crate::Message::payload_as
//! [`to_payload`]: crate::message::to_payload

use crate::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `handshake` payload sent by the peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Runtime identifier of the peer, e.g. "python"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Peer software version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Capabilities the peer advertises as a whole
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `handshake_response` payload sent by the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    /// Bridge name
    pub bridge: String,
    /// Bridge version
    pub version: String,
    /// Whether the peer was accepted
    pub accepted: bool,
}

/// `agent_registration` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Unique agent name
    pub name: String,
    /// Capabilities the agent can perform
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form agent metadata
    #[serde(default)]
    pub metadata: Payload,
}

/// `task_request` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-assigned task identifier
    pub task_id: String,
    /// Capabilities the caller asked for
    pub capabilities: Vec<String>,
    /// Task body
    #[serde(default)]
    pub task: Payload,
}

/// `task_response` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Identifier of the task being answered
    pub task_id: String,
    /// Task result, `null` when absent
    #[serde(default)]
    pub result: Value,
    /// Error text when the task failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stats snapshot carried by heartbeats and their responses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Tasks currently in flight
    pub active_tasks: usize,
    /// Agents currently registered
    pub registered_agents: usize,
    /// Tasks completed since the bridge started
    #[serde(default)]
    pub tasks_completed: u64,
    /// Blended average response time
    #[serde(default)]
    pub avg_response_time_ms: f64,
}

/// What an `agent_query` asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// List the peer's agents; answered with `agent_query_response`
    Agents,
    /// Report peer status; answered with `status_response`
    Status,
}

/// `agent_query` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentQuery {
    /// Query kind
    pub query: QueryKind,
}
