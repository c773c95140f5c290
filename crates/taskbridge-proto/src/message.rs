//! Message envelope and message types

use crate::ProtocolError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Opaque payload map carried by every message
pub type Payload = Map<String, Value>;

/// Message type tag, encoded on the wire as a snake_case string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Peer introduces itself after connecting
    Handshake,
    /// Bridge acknowledges a handshake
    HandshakeResponse,
    /// Peer announces an agent and its capabilities
    AgentRegistration,
    /// Bridge assigns a task to an agent
    TaskRequest,
    /// Peer reports the outcome of a task
    TaskResponse,
    /// Liveness check, sent by either side
    Heartbeat,
    /// Reply to a liveness check
    HeartbeatResponse,
    /// Bridge asks the peer about its agents or status
    AgentQuery,
    /// Peer answers an agent query
    AgentQueryResponse,
    /// Peer answers a status query
    StatusResponse,
    /// Either side is going away
    Shutdown,
    /// A type string this version does not know
    Unknown(String),
}

impl MessageType {
    /// Wire name of this type
    pub fn as_str(&self) -> &str {
        match self {
            Self::Handshake => "handshake",
            Self::HandshakeResponse => "handshake_response",
            Self::AgentRegistration => "agent_registration",
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatResponse => "heartbeat_response",
            Self::AgentQuery => "agent_query",
            Self::AgentQueryResponse => "agent_query_response",
            Self::StatusResponse => "status_response",
            Self::Shutdown => "shutdown",
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "handshake" => Self::Handshake,
            "handshake_response" => Self::HandshakeResponse,
            "agent_registration" => Self::AgentRegistration,
            "task_request" => Self::TaskRequest,
            "task_response" => Self::TaskResponse,
            "heartbeat" => Self::Heartbeat,
            "heartbeat_response" => Self::HeartbeatResponse,
            "agent_query" => Self::AgentQuery,
            "agent_query_response" => Self::AgentQueryResponse,
            "status_response" => Self::StatusResponse,
            "shutdown" => Self::Shutdown,
            _ => Self::Unknown(name),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol message exchanged with the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,
    /// Message type
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Sender name
    pub source: String,
    /// Intended receiver name
    pub target: String,
    /// Type-specific payload
    #[serde(default)]
    pub payload: Payload,
    /// ID of the message this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Creation time, ISO-8601 on the wire
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(|e| de::Error::custom(format!("invalid timestamp {:?}: {}", raw, e)))
}

impl Message {
    /// Create a message with a fresh ID and no correlation
    pub fn new(
        kind: MessageType,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source: source.into(),
            target: target.into(),
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a reply addressed to this message's sender and correlated to its ID
    pub fn reply(&self, kind: MessageType, source: impl Into<String>, payload: Payload) -> Self {
        let mut reply = Self::new(kind, source, self.source.clone(), payload);
        reply.correlation_id = Some(self.id.clone());
        reply
    }

    /// Set the correlation ID
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Whether this message answers `other`
    pub fn is_reply_to(&self, other: &Message) -> bool {
        self.correlation_id.as_deref() == Some(other.id.as_str())
    }

    /// Deserialize the payload into a typed view
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            ProtocolError::InvalidPayload {
                kind: self.kind.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Serialize a typed payload into a payload map
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload, ProtocolError> {
    match serde_json::to_value(value).map_err(|e| ProtocolError::Encode(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::Encode(format!(
            "payload must serialize to a map, got {}",
            other
        ))),
    }
}
